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

//! BlueZ RFCOMM backend.

use anyhow::Result;
use async_trait::async_trait;
use bluer::agent::{Agent, ReqError, RequestPinCode};
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, ErrorKind};
use futures::{pin_mut, StreamExt};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{Capability, Connection, LinkBackend};
use super::device::Device;
use super::discovery::ScanSink;
use crate::error::LinkError;

/// Standard SPP UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

fn map_err(e: bluer::Error) -> LinkError {
    match e.kind {
        ErrorKind::NotAuthorized => LinkError::PermissionDenied(e.message),
        ErrorKind::NotSupported => LinkError::PlatformUnsupported {
            operation: "adapter operation",
            backend: "bluez",
        },
        _ => LinkError::Backend(e.to_string()),
    }
}

/// Link backend over the BlueZ D-Bus API and RFCOMM sockets.
pub struct BluezBackend {
    session: bluer::Session,
    adapter: bluer::Adapter,
    channel: u8,
}

impl BluezBackend {
    /// Create a new BlueZ backend on the default adapter.
    pub async fn new(channel: u8) -> Result<Self> {
        info!("Initializing BlueZ backend...");

        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        Ok(Self {
            session,
            adapter,
            channel,
        })
    }

    async fn device_name(&self, addr: Address) -> String {
        let Ok(device) = self.adapter.device(addr) else {
            return String::new();
        };
        match device.name().await {
            Ok(Some(name)) => name,
            _ => device.alias().await.unwrap_or_default(),
        }
    }

    /// Pair with `device`, answering PIN requests with `pin`.
    async fn pair(&self, device: &bluer::Device, pin: Option<&str>) -> Result<(), LinkError> {
        let pin = pin.map(str::to_string);
        let agent = Agent {
            request_default: false,
            request_pin_code: Some(Box::new(move |req: RequestPinCode| {
                let pin = pin.clone();
                Box::pin(async move {
                    debug!("PIN requested by {}", req.device);
                    pin.ok_or(ReqError::Rejected)
                })
            })),
            ..Default::default()
        };
        let _agent_handle = self.session.register_agent(agent).await.map_err(map_err)?;

        info!("Pairing with {}...", device.address());
        device.pair().await.map_err(map_err)?;
        info!("Paired with {}", device.address());
        Ok(())
    }
}

#[async_trait]
impl LinkBackend for BluezBackend {
    fn name(&self) -> &'static str {
        "bluez"
    }

    fn supports(&self, _capability: Capability) -> bool {
        true
    }

    async fn check_permission(&self) -> Result<(), LinkError> {
        if !self.adapter.is_powered().await.map_err(map_err)? {
            info!("Powering on Bluetooth adapter...");
            self.adapter.set_powered(true).await.map_err(map_err)?;
        }
        Ok(())
    }

    async fn discover(&self, sink: ScanSink, window: Duration) -> Result<(), LinkError> {
        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::BrEdr,
            ..Default::default()
        };
        self.adapter
            .set_discovery_filter(filter)
            .await
            .map_err(map_err)?;

        let events = self.adapter.discover_devices().await.map_err(map_err)?;
        pin_mut!(events);

        let deadline = tokio::time::sleep(window);
        pin_mut!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => match event {
                    Some(AdapterEvent::DeviceAdded(addr)) => {
                        let name = self.device_name(addr).await;
                        sink.found(Device::new(name, addr.to_string()));
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        Ok(())
    }

    async fn connect(&self, address: &str, pin: Option<&str>) -> Result<Connection, LinkError> {
        let addr: Address = address
            .parse()
            .map_err(|_| LinkError::InvalidOperation(format!("invalid address: {}", address)))?;
        let device = self.adapter.device(addr).map_err(map_err)?;

        if !device.is_paired().await.map_err(map_err)? {
            self.pair(&device, pin).await?;
        }

        let stream = Stream::connect(SocketAddr::new(addr, self.channel))
            .await
            .map_err(|e| {
                warn!("RFCOMM connect to {} failed: {}", addr, e);
                LinkError::from(e)
            })?;
        info!(
            "RFCOMM link to {} on channel {} (SPP {})",
            addr, self.channel, SPP_UUID
        );

        let name = device.alias().await.ok();
        Ok(Connection {
            stream: Box::new(stream),
            name,
        })
    }
}
