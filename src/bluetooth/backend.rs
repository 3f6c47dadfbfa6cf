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

//! Link backend abstraction and factory.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use super::discovery::ScanSink;
use super::simulated::SimulatedBackend;
use crate::config::Config;
use crate::error::LinkError;

/// Operations a backend may or may not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Permission,
    Discovery,
    Connect,
    SessionState,
    Send,
    Receive,
    Stop,
}

impl Capability {
    /// Name of the public operation gated by this capability.
    pub fn operation(&self) -> &'static str {
        match self {
            Capability::Permission => "check_permission",
            Capability::Discovery => "discovery",
            Capability::Connect => "connect",
            Capability::SessionState => "session state query",
            Capability::Send => "send",
            Capability::Receive => "receive",
            Capability::Stop => "stop",
        }
    }
}

/// Byte stream to a connected peer.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

/// An established connection handed back by a backend.
pub struct Connection {
    pub stream: Box<dyn LinkStream>,
    /// Peer name, if the backend could resolve one.
    pub name: Option<String>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("name", &self.name).finish()
    }
}

/// Trait for link backends.
///
/// Backends only do the native work: permission checks, scanning, and
/// opening a stream. Session state, buffering and cancellation are handled
/// by the link manager.
#[async_trait]
pub trait LinkBackend: Send + Sync {
    /// Get the backend name (e.g., "bluez", "simulated").
    fn name(&self) -> &'static str;

    /// Whether the backend implements an operation.
    fn supports(&self, capability: Capability) -> bool;

    /// Verify that Bluetooth access has been granted.
    async fn check_permission(&self) -> Result<(), LinkError>;

    /// Scan for devices for at most `window`, reporting them to `sink`.
    async fn discover(&self, sink: ScanSink, window: Duration) -> Result<(), LinkError>;

    /// Open a stream to the device at `address`, pairing with `pin` if needed.
    async fn connect(&self, address: &str, pin: Option<&str>) -> Result<Connection, LinkError>;
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Auto,
    Bluez,
    Simulated,
    Unsupported,
}

impl BackendKind {
    /// Resolve `Auto` to the native backend for this build.
    pub fn resolve(self) -> Self {
        match self {
            BackendKind::Auto => {
                if cfg!(all(feature = "bluez", target_os = "linux")) {
                    BackendKind::Bluez
                } else {
                    BackendKind::Unsupported
                }
            }
            other => other,
        }
    }
}

/// Create the backend selected by the configuration.
pub async fn create_backend(config: &Config) -> Result<Arc<dyn LinkBackend>> {
    let kind = config.link.backend.resolve();
    info!("Link backend: {:?}", kind);

    match kind {
        BackendKind::Bluez => {
            #[cfg(all(feature = "bluez", target_os = "linux"))]
            {
                let backend = super::bluez::BluezBackend::new(config.link.rfcomm_channel).await?;
                Ok(Arc::new(backend))
            }
            #[cfg(not(all(feature = "bluez", target_os = "linux")))]
            {
                Err(anyhow!("BlueZ support not compiled in"))
            }
        }
        BackendKind::Simulated => Ok(Arc::new(SimulatedBackend::from_config(&config.simulated))),
        BackendKind::Unsupported => {
            warn!("No native Bluetooth backend on this platform");
            Ok(Arc::new(UnsupportedBackend))
        }
        BackendKind::Auto => Err(anyhow!("backend selection did not resolve")),
    }
}

/// Backend for platforms without Bluetooth support.
///
/// Every operation fails with [`LinkError::PlatformUnsupported`].
#[derive(Debug, Default)]
pub struct UnsupportedBackend;

impl UnsupportedBackend {
    fn unsupported(capability: Capability) -> LinkError {
        LinkError::PlatformUnsupported {
            operation: capability.operation(),
            backend: "unsupported",
        }
    }
}

#[async_trait]
impl LinkBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn supports(&self, _capability: Capability) -> bool {
        false
    }

    async fn check_permission(&self) -> Result<(), LinkError> {
        Err(Self::unsupported(Capability::Permission))
    }

    async fn discover(&self, _sink: ScanSink, _window: Duration) -> Result<(), LinkError> {
        Err(Self::unsupported(Capability::Discovery))
    }

    async fn connect(&self, _address: &str, _pin: Option<&str>) -> Result<Connection, LinkError> {
        Err(Self::unsupported(Capability::Connect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_kind_resolves_to_itself() {
        assert_eq!(BackendKind::Simulated.resolve(), BackendKind::Simulated);
        assert_ne!(BackendKind::Auto.resolve(), BackendKind::Auto);
    }

    #[tokio::test]
    async fn test_unsupported_backend_fails_fast() {
        let backend = UnsupportedBackend;
        assert!(!backend.supports(Capability::Connect));

        let err = backend.connect("AA:BB", None).await.unwrap_err();
        assert_eq!(
            err,
            LinkError::PlatformUnsupported {
                operation: "connect",
                backend: "unsupported"
            }
        );
        assert!(matches!(
            backend.check_permission().await,
            Err(LinkError::PlatformUnsupported { .. })
        ));
    }
}
