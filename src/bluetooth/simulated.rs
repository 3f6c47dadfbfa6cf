// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-memory backend for tests and demos.
//!
//! Devices are declared up front. Each successful connect creates a duplex
//! pipe; the far end is handed out through [`SimulatedBackend::accept_peer`]
//! so a test can play the remote device.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::backend::{Capability, Connection, LinkBackend};
use super::device::Device;
use super::discovery::ScanSink;
use crate::config::SimulatedConfig;
use crate::error::LinkError;

/// Capacity of each simulated pipe direction.
const PIPE_CAPACITY: usize = 8192;

/// Remote ends kept waiting for [`SimulatedBackend::accept_peer`].
const PEER_QUEUE_CAPACITY: usize = 4;

/// A device known to the simulated backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedDevice {
    pub name: String,
    pub address: String,

    /// PIN required to pair, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,

    /// Unreachable devices never answer a connect.
    #[serde(default = "default_reachable")]
    pub reachable: bool,
}

fn default_reachable() -> bool {
    true
}

impl SimulatedDevice {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            pin: None,
            reachable: true,
        }
    }

    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(pin.to_string());
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    fn device(&self) -> Device {
        Device::new(self.name.clone(), self.address.clone())
    }
}

/// Remote end of a simulated connection.
#[derive(Debug)]
pub struct SimulatedPeer {
    pub device: Device,
    pub stream: DuplexStream,
}

/// Simulated link backend.
#[derive(Debug)]
pub struct SimulatedBackend {
    devices: Vec<SimulatedDevice>,
    scan_delay: Duration,
    permission_granted: bool,
    peer_tx: mpsc::Sender<SimulatedPeer>,
    peer_rx: Mutex<mpsc::Receiver<SimulatedPeer>>,
}

impl SimulatedBackend {
    /// Create a simulated backend with the given devices.
    pub fn new(devices: Vec<SimulatedDevice>) -> Self {
        let (peer_tx, peer_rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        Self {
            devices,
            scan_delay: Duration::ZERO,
            permission_granted: true,
            peer_tx,
            peer_rx: Mutex::new(peer_rx),
        }
    }

    /// Create from configuration.
    pub fn from_config(config: &SimulatedConfig) -> Self {
        Self::new(config.devices.clone())
            .with_scan_delay(Duration::from_millis(config.scan_delay_ms))
            .with_permission(config.permission_granted)
    }

    /// Delay before each device is reported during a scan.
    pub fn with_scan_delay(mut self, delay: Duration) -> Self {
        self.scan_delay = delay;
        self
    }

    pub fn with_permission(mut self, granted: bool) -> Self {
        self.permission_granted = granted;
        self
    }

    /// Wait for the next connection and take its remote end.
    ///
    /// At most four remote ends are held; later ones are
    /// closed at once so their links end with EOF.
    pub async fn accept_peer(&self) -> Option<SimulatedPeer> {
        self.peer_rx.lock().await.recv().await
    }

    fn find(&self, address: &str) -> Option<&SimulatedDevice> {
        self.devices
            .iter()
            .find(|d| d.address.eq_ignore_ascii_case(address))
    }
}

#[async_trait]
impl LinkBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn supports(&self, _capability: Capability) -> bool {
        true
    }

    async fn check_permission(&self) -> Result<(), LinkError> {
        if self.permission_granted {
            Ok(())
        } else {
            Err(LinkError::PermissionDenied(
                "Bluetooth access not granted".to_string(),
            ))
        }
    }

    async fn discover(&self, sink: ScanSink, window: Duration) -> Result<(), LinkError> {
        let scan = async {
            for device in &self.devices {
                if !self.scan_delay.is_zero() {
                    tokio::time::sleep(self.scan_delay).await;
                }
                sink.found(device.device());
            }
        };

        if tokio::time::timeout(window, scan).await.is_err() {
            debug!("Simulated scan window elapsed");
        }
        Ok(())
    }

    async fn connect(&self, address: &str, pin: Option<&str>) -> Result<Connection, LinkError> {
        self.check_permission().await?;

        let device = self
            .find(address)
            .ok_or_else(|| LinkError::Backend(format!("device {} not found", address)))?;

        if !device.reachable {
            debug!("Simulated device {} does not answer", address);
            std::future::pending::<()>().await;
        }

        if let Some(required) = &device.pin {
            if pin.unwrap_or("") != required {
                return Err(LinkError::Backend("authentication rejected".to_string()));
            }
        }

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let peer = SimulatedPeer {
            device: device.device(),
            stream: far,
        };
        match self.peer_tx.try_send(peer) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(peer)) => {
                debug!("Nobody accepts simulated peers, closing {}", peer.device);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(LinkError::Backend("simulated peer channel closed".to_string()));
            }
        }

        info!("Simulated link to {} opened", device.device());
        Ok(Connection {
            stream: Box::new(near),
            name: Some(device.name.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::discovery::DeviceCatalog;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn backend() -> SimulatedBackend {
        SimulatedBackend::new(vec![
            SimulatedDevice::new("Pico A", "AA:BB:CC:01"),
            SimulatedDevice::new("Pico B", "AA:BB:CC:02").with_pin("1234"),
        ])
    }

    #[tokio::test]
    async fn test_discover_reports_all_devices() {
        let catalog = Arc::new(DeviceCatalog::new());
        let id = catalog.begin_scan().unwrap();

        backend()
            .discover(ScanSink::new(catalog.clone(), id), Duration::from_secs(1))
            .await
            .unwrap();
        catalog.finish_scan(id);

        let names: Vec<_> = catalog.snapshot().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["Pico A", "Pico B"]);
    }

    #[tokio::test]
    async fn test_discover_respects_window() {
        let catalog = Arc::new(DeviceCatalog::new());
        let id = catalog.begin_scan().unwrap();

        backend()
            .with_scan_delay(Duration::from_millis(200))
            .discover(ScanSink::new(catalog.clone(), id), Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(catalog.finish_scan(id), Some(0));
    }

    #[tokio::test]
    async fn test_pin_checked() {
        let backend = backend();
        assert!(backend.connect("AA:BB:CC:02", Some("0000")).await.is_err());
        assert!(backend.connect("AA:BB:CC:02", None).await.is_err());

        let conn = backend.connect("aa:bb:cc:02", Some("1234")).await.unwrap();
        assert_eq!(conn.name.as_deref(), Some("Pico B"));

        let peer = backend.accept_peer().await.unwrap();
        assert_eq!(peer.device.address, "AA:BB:CC:02");
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let err = backend().connect("00:00:00:00", None).await.unwrap_err();
        assert!(matches!(err, LinkError::Backend(_)));
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let backend = backend().with_permission(false);
        assert!(matches!(
            backend.check_permission().await,
            Err(LinkError::PermissionDenied(_))
        ));
        assert!(matches!(
            backend.connect("AA:BB:CC:01", None).await,
            Err(LinkError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_unaccepted_peers_are_closed() {
        let backend = backend();
        let mut links = Vec::new();
        for _ in 0..PEER_QUEUE_CAPACITY {
            links.push(backend.connect("AA:BB:CC:01", None).await.unwrap());
        }

        // Queue is full, so this link's far end is dropped
        let mut overflow = backend.connect("AA:BB:CC:01", None).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(overflow.stream.read(&mut buf).await.unwrap(), 0);

        // Queued peers are still live
        let mut peer = backend.accept_peer().await.unwrap();
        peer.stream.write_all(b"hi").await.unwrap();
        assert_eq!(links[0].stream.read(&mut buf).await.unwrap(), 2);
    }
}
