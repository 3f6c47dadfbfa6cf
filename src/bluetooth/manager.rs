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

//! Link manager: discovery, single-session connection and line I/O.
//!
//! The manager owns at most one session. `connect` and `read_line` suspend
//! the caller; both are released by `stop` from another task.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{Capability, Connection, LinkBackend, LinkStream};
use super::connection::{
    run_reader, ConnectionState, DisconnectReason, EventSender, Inbound, LinkEvent,
};
use super::device::Device;
use super::discovery::{DeviceCatalog, ScanSink};
use super::line_buffer::{LineBuffer, DEFAULT_DELIMITER, DEFAULT_MAX_LINE_LENGTH};
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};

/// Capacity of the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Runtime settings for the link manager.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub connect_timeout: Duration,
    pub discovery_window: Duration,
    pub line_delimiter: Vec<u8>,
    pub max_line_length: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            discovery_window: Duration::from_secs(12),
            line_delimiter: DEFAULT_DELIMITER.to_vec(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl From<&LinkConfig> for LinkSettings {
    fn from(config: &LinkConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            discovery_window: config.discovery_window(),
            line_delimiter: config.line_delimiter.as_bytes().to_vec(),
            max_line_length: config.max_line_length,
        }
    }
}

type LinkWriter = Arc<tokio::sync::Mutex<WriteHalf<Box<dyn LinkStream>>>>;

/// Resources of an established session.
struct ActiveLink {
    peer: Device,
    inbound: Arc<Inbound>,
    writer: LinkWriter,
    reader: JoinHandle<()>,
}

impl ActiveLink {
    /// Release the transport. Dropping both halves closes the stream.
    fn close(self, error: LinkError) {
        self.inbound.close(error);
        self.reader.abort();
    }
}

struct Session {
    state: ConnectionState,
    /// Incremented on every connect attempt.
    generation: u64,
    link: Option<ActiveLink>,
}

/// State shared with the reader task.
struct Shared {
    session: Mutex<Session>,
    events: EventSender,
    /// Bumped by every stop; pending connects watch it.
    stop_tx: watch::Sender<u64>,
}

impl Shared {
    /// Tear down session `generation` after a transport failure.
    fn link_lost(&self, generation: u64, reason: String) {
        let link = {
            let mut session = self.session.lock();
            if session.generation != generation || session.link.is_none() {
                return;
            }
            session.state = ConnectionState::Disconnected;
            session.link.take()
        };

        if let Some(link) = link {
            warn!("Link to {} lost: {}", link.peer, reason);
            link.close(LinkError::ConnectionLost(reason.clone()));
            self.events.emit(LinkEvent::Disconnected {
                reason: DisconnectReason::Lost(reason),
            });
        }
    }

    /// Reset to `Disconnected` and cancel anything in flight.
    fn stop(&self) {
        let (previous, link) = {
            let mut session = self.session.lock();
            // Connects subscribe under this lock too
            self.stop_tx.send_modify(|n| *n = n.wrapping_add(1));
            let previous = session.state;
            session.state = ConnectionState::Disconnected;
            (previous, session.link.take())
        };

        if let Some(link) = link {
            info!("Closing link to {}", link.peer);
            link.close(LinkError::Cancelled);
        }

        if previous != ConnectionState::Disconnected {
            self.events.emit(LinkEvent::Disconnected {
                reason: DisconnectReason::Stopped,
            });
        } else {
            debug!("Stop while disconnected");
        }
    }
}

/// A running discovery task.
struct ScanTask {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Manager for one Bluetooth serial link.
pub struct LinkManager {
    backend: Arc<dyn LinkBackend>,
    settings: LinkSettings,
    catalog: Arc<DeviceCatalog>,
    shared: Arc<Shared>,
    scan: Mutex<Option<ScanTask>>,
    event_rx: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
}

impl LinkManager {
    /// Create a new link manager over `backend`.
    pub fn new(backend: Arc<dyn LinkBackend>, settings: LinkSettings) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (stop_tx, _) = watch::channel(0);

        info!("Link manager using {} backend", backend.name());

        Self {
            backend,
            settings,
            catalog: Arc::new(DeviceCatalog::new()),
            shared: Arc::new(Shared {
                session: Mutex::new(Session {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    link: None,
                }),
                events: EventSender::new(event_tx),
                stop_tx,
            }),
            scan: Mutex::new(None),
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<LinkEvent>> {
        self.event_rx.lock().take()
    }

    /// Name of the active backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    fn ensure(&self, capability: Capability) -> Result<()> {
        if self.backend.supports(capability) {
            Ok(())
        } else {
            Err(LinkError::PlatformUnsupported {
                operation: capability.operation(),
                backend: self.backend.name(),
            })
        }
    }

    /// Initialize the manager.
    ///
    /// Call once before discovery or connect.
    pub async fn init(&self) -> Result<()> {
        self.check_permission().await?;
        info!("Link manager initialized");
        Ok(())
    }

    /// Verify that Bluetooth access has been granted.
    pub async fn check_permission(&self) -> Result<()> {
        self.ensure(Capability::Permission)?;
        self.backend.check_permission().await.map_err(|e| {
            error!("Bluetooth permission check failed: {}", e);
            e
        })
    }

    /// Start scanning for nearby devices.
    ///
    /// A no-op if a scan is already running. Must be called from within a
    /// Tokio runtime.
    pub fn start_discovery(&self) -> Result<()> {
        self.ensure(Capability::Discovery)?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LinkError::Backend(format!("no async runtime: {}", e)))?;

        let Some(scan_id) = self.catalog.begin_scan() else {
            debug!("Discovery already in progress");
            return Ok(());
        };

        info!("Starting discovery (window {:?})", self.settings.discovery_window);
        self.shared.events.emit(LinkEvent::DiscoveryStarted);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let backend = self.backend.clone();
        let catalog = self.catalog.clone();
        let shared = self.shared.clone();
        let window = self.settings.discovery_window;

        let handle = runtime.spawn(async move {
            let sink = ScanSink::new(catalog.clone(), scan_id);
            let outcome = tokio::select! {
                res = backend.discover(sink, window) => res,
                _ = cancel_rx => {
                    debug!("Discovery stopped early");
                    Ok(())
                }
            };

            match outcome {
                Ok(()) => {
                    if let Some(count) = catalog.finish_scan(scan_id) {
                        info!("Discovery finished: {} devices", count);
                        shared.events.emit(LinkEvent::DiscoveryFinished {
                            devices: catalog.snapshot(),
                        });
                    }
                }
                Err(e) => {
                    error!("Discovery failed: {}", e);
                    catalog.abort_scan(scan_id);
                }
            }
        });

        *self.scan.lock() = Some(ScanTask {
            cancel: cancel_tx,
            handle,
        });
        Ok(())
    }

    /// End a running scan early, publishing what was found so far.
    pub fn stop_discovery(&self) -> Result<()> {
        self.ensure(Capability::Discovery)?;

        if let Some(task) = self.scan.lock().take() {
            if self.catalog.is_scanning() {
                info!("Stopping discovery");
            }
            let _ = task.cancel.send(());
        }
        Ok(())
    }

    /// Whether a scan is running.
    pub fn is_discovering(&self) -> bool {
        self.catalog.is_scanning()
    }

    /// Devices found by the last completed scan, in discovery order.
    pub fn available_devices(&self) -> Result<Vec<Device>> {
        self.ensure(Capability::Discovery)?;
        Ok(self.catalog.snapshot())
    }

    /// Connect to the device at `address`.
    ///
    /// Suspends until the connection succeeds (`true`), fails or times out
    /// (`false`), or is cancelled by [`stop`](Self::stop).
    pub async fn connect(&self, address: &str, pin: Option<&str>) -> Result<bool> {
        self.ensure(Capability::Connect)?;

        let address = address.trim();
        if address.is_empty() {
            return Err(LinkError::InvalidOperation("empty device address".into()));
        }
        let pin = pin.filter(|p| !p.is_empty());

        let (generation, mut stop_rx) = {
            let mut session = self.shared.session.lock();
            if session.state != ConnectionState::Disconnected {
                return Err(LinkError::InvalidOperation(format!(
                    "cannot connect while {}",
                    session.state.as_str()
                )));
            }
            session.generation += 1;
            session.state = ConnectionState::Connecting;
            (session.generation, self.shared.stop_tx.subscribe())
        };

        info!("Connecting to {}...", address);
        self.shared.events.emit(LinkEvent::Connecting {
            address: address.to_string(),
        });

        let timeout = self.settings.connect_timeout;
        let attempt = tokio::select! {
            res = tokio::time::timeout(timeout, self.backend.connect(address, pin)) => match res {
                Ok(res) => res,
                Err(_) => Err(LinkError::Backend(format!("timed out after {:?}", timeout))),
            },
            _ = stop_rx.changed() => {
                info!("Connect to {} cancelled", address);
                return Err(LinkError::Cancelled);
            }
        };

        match attempt {
            Ok(connection) => self.establish(generation, address, connection),
            Err(e) => {
                {
                    let mut session = self.shared.session.lock();
                    if session.generation == generation
                        && session.state == ConnectionState::Connecting
                    {
                        session.state = ConnectionState::Disconnected;
                    }
                }

                warn!("Connect to {} failed: {}", address, e);
                self.shared.events.emit(LinkEvent::ConnectFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                });

                match e {
                    LinkError::PermissionDenied(_) | LinkError::PlatformUnsupported { .. } => {
                        Err(e)
                    }
                    _ => Ok(false),
                }
            }
        }
    }

    /// Promote a `Connecting` session to `Connected`.
    fn establish(&self, generation: u64, address: &str, connection: Connection) -> Result<bool> {
        let name = self
            .catalog
            .lookup(address)
            .map(|d| d.name)
            .filter(|n| !n.is_empty())
            .or(connection.name)
            .unwrap_or_default();
        let peer = Device::new(name, address);

        let mut session = self.shared.session.lock();
        if session.generation != generation || session.state != ConnectionState::Connecting {
            // Stopped between the handshake completing and this point
            info!("Discarding link to {} after stop", peer);
            return Err(LinkError::Cancelled);
        }

        let (reader, writer) = tokio::io::split(connection.stream);
        let inbound = Arc::new(Inbound::new(LineBuffer::new(
            &self.settings.line_delimiter,
            self.settings.max_line_length,
        )));

        let reader = {
            let inbound = inbound.clone();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let reason = run_reader(reader, &inbound).await;
                shared.link_lost(generation, reason);
            })
        };

        session.state = ConnectionState::Connected;
        session.link = Some(ActiveLink {
            peer: peer.clone(),
            inbound,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            reader,
        });
        drop(session);

        info!("Connected to {}", peer);
        self.shared.events.emit(LinkEvent::Connected { device: peer });
        Ok(true)
    }

    /// Whether a session is connected.
    pub fn is_connected(&self) -> Result<bool> {
        self.ensure(Capability::SessionState)?;
        Ok(self.connection_state() == ConnectionState::Connected)
    }

    /// The connected device, or the empty sentinel when not connected.
    pub fn connected_device(&self) -> Result<Device> {
        self.ensure(Capability::SessionState)?;
        Ok(self.peer().unwrap_or_default())
    }

    /// The connected device, if any.
    pub fn peer(&self) -> Option<Device> {
        self.shared
            .session
            .lock()
            .link
            .as_ref()
            .map(|link| link.peer.clone())
    }

    /// Current session state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.session.lock().state
    }

    /// Write raw bytes to the peer. No line terminator is appended.
    ///
    /// Returns `false` if the transport failed; the session is then
    /// disconnected. A write still pending when the session is stopped
    /// fails with `Cancelled`.
    pub async fn send(&self, data: &[u8]) -> Result<bool> {
        self.ensure(Capability::Send)?;

        let (generation, writer, inbound) = {
            let session = self.shared.session.lock();
            match (&session.state, &session.link) {
                (ConnectionState::Connected, Some(link)) => {
                    (session.generation, link.writer.clone(), link.inbound.clone())
                }
                _ => return Err(LinkError::NotConnected),
            }
        };

        let write = async {
            let mut writer = writer.lock().await;
            writer.write_all(data).await?;
            writer.flush().await
        };

        let result = tokio::select! {
            res = write => res,
            reason = inbound.closed() => {
                // The pending write is dropped here, releasing the stream
                return match reason {
                    LinkError::Cancelled => {
                        info!("Send cancelled");
                        Err(LinkError::Cancelled)
                    }
                    other => {
                        warn!("Send aborted: {}", other);
                        Ok(false)
                    }
                };
            }
        };

        match result {
            Ok(()) => {
                debug!("Sent {} bytes", data.len());
                Ok(true)
            }
            Err(e) => {
                error!("Send failed: {}", e);
                self.shared.link_lost(generation, e.to_string());
                Ok(false)
            }
        }
    }

    fn inbound(&self) -> Result<Arc<Inbound>> {
        let session = self.shared.session.lock();
        match (&session.state, &session.link) {
            (ConnectionState::Connected, Some(link)) => Ok(link.inbound.clone()),
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Number of received bytes not yet consumed by [`read_line`](Self::read_line).
    pub fn available(&self) -> Result<usize> {
        self.ensure(Capability::Receive)?;
        Ok(self.inbound()?.available())
    }

    /// Read the next line, delimiter stripped.
    ///
    /// Suspends until a full line arrives. Fails with `ConnectionLost` if
    /// the transport closes and `Cancelled` if the session is stopped.
    pub async fn read_line(&self) -> Result<String> {
        self.ensure(Capability::Receive)?;
        let line = self.inbound()?.read_line().await?;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Close the session. Valid in any state; idempotent.
    pub fn stop(&self) -> Result<()> {
        self.ensure(Capability::Stop)?;
        self.shared.stop();
        Ok(())
    }

    /// Release every resource: running scan and session.
    pub fn shutdown(&self) {
        if let Some(task) = self.scan.lock().take() {
            task.handle.abort();
        }
        if let Some(scan_id) = self.catalog.current_scan() {
            self.catalog.abort_scan(scan_id);
        }
        self.shared.stop();
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::backend::UnsupportedBackend;
    use crate::bluetooth::simulated::{SimulatedBackend, SimulatedDevice};
    use async_trait::async_trait;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{
        AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
    };

    /// Stream that never yields data and rejects every write.
    struct BrokenWrites;

    impl AsyncRead for BrokenWrites {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenWrites {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Backend whose connections fail on the first write.
    struct BrokenWriteBackend;

    #[async_trait]
    impl LinkBackend for BrokenWriteBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn supports(&self, _capability: Capability) -> bool {
            true
        }

        async fn check_permission(&self) -> Result<()> {
            Ok(())
        }

        async fn discover(&self, _sink: ScanSink, _window: Duration) -> Result<()> {
            Ok(())
        }

        async fn connect(&self, _address: &str, _pin: Option<&str>) -> Result<Connection> {
            Ok(Connection {
                stream: Box::new(BrokenWrites),
                name: Some("Flaky".to_string()),
            })
        }
    }

    fn simulated() -> Arc<SimulatedBackend> {
        Arc::new(SimulatedBackend::new(vec![
            SimulatedDevice::new("Pico A", "AA:BB:CC:01"),
            SimulatedDevice::new("Pico B", "AA:BB:CC:02"),
            SimulatedDevice::new("Locked", "AA:BB:CC:03").with_pin("4321"),
            SimulatedDevice::new("Gone", "AA:BB:CC:04").unreachable(),
        ]))
    }

    fn manager(backend: Arc<SimulatedBackend>) -> LinkManager {
        LinkManager::new(backend, LinkSettings::default())
    }

    async fn wait_for_scan(manager: &LinkManager) {
        while manager.is_discovering() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let manager = manager(simulated());
        assert!(manager.connect("AA:BB:CC:01", None).await.unwrap());

        let err = manager.connect("AA:BB:CC:02", None).await.unwrap_err();
        assert!(matches!(err, LinkError::InvalidOperation(_)));
        assert_eq!(manager.connected_device().unwrap().address, "AA:BB:CC:01");
    }

    #[tokio::test]
    async fn test_connect_failure_returns_false() {
        let manager = manager(simulated());
        assert!(!manager.connect("AA:BB:CC:03", Some("0000")).await.unwrap());
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

        assert!(!manager.connect("11:22:33:44", None).await.unwrap());
        assert!(manager.connect("AA:BB:CC:03", Some("4321")).await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_empty_address() {
        let manager = manager(simulated());
        assert!(matches!(
            manager.connect("  ", None).await,
            Err(LinkError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let settings = LinkSettings {
            connect_timeout: Duration::from_millis(50),
            ..LinkSettings::default()
        };
        let manager = LinkManager::new(simulated(), settings);

        assert!(!manager.connect("AA:BB:CC:04", None).await.unwrap());
        assert!(!manager.is_connected().unwrap());
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_connect() {
        let manager = Arc::new(manager(simulated()));

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect("AA:BB:CC:04", None).await })
        };

        while manager.connection_state() != ConnectionState::Connecting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        manager.stop().unwrap();

        assert_eq!(pending.await.unwrap(), Err(LinkError::Cancelled));
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

        // Session is reusable
        assert!(manager.connect("AA:BB:CC:01", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_read() {
        let manager = Arc::new(manager(simulated()));
        assert!(manager.connect("AA:BB:CC:01", None).await.unwrap());

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.read_line().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.stop().unwrap();
        assert_eq!(pending.await.unwrap(), Err(LinkError::Cancelled));
    }

    #[tokio::test]
    async fn test_io_requires_connection() {
        let manager = manager(simulated());
        assert_eq!(manager.send(b"x").await, Err(LinkError::NotConnected));
        assert_eq!(manager.available(), Err(LinkError::NotConnected));
        assert_eq!(manager.read_line().await, Err(LinkError::NotConnected));
    }

    #[tokio::test]
    async fn test_remote_close_is_connection_lost() {
        let backend = simulated();
        let manager = Arc::new(manager(backend.clone()));
        assert!(manager.connect("AA:BB:CC:01", None).await.unwrap());
        let peer = backend.accept_peer().await.unwrap();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.read_line().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut stream = peer.stream;
        stream.write_all(b"half a li").await.unwrap();
        drop(stream);

        assert!(matches!(
            pending.await.unwrap(),
            Err(LinkError::ConnectionLost(_))
        ));
        assert!(!manager.is_connected().unwrap());
        assert!(manager.connected_device().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_failure_disconnects() {
        let manager = LinkManager::new(Arc::new(BrokenWriteBackend), LinkSettings::default());
        let mut events = manager.take_event_receiver().unwrap();
        assert!(manager.connect("AA:BB:CC:07", None).await.unwrap());

        assert_eq!(manager.send(b"PING\n").await, Ok(false));
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        assert!(manager.connected_device().unwrap().is_none());
        assert_eq!(manager.send(b"PING\n").await, Err(LinkError::NotConnected));

        assert!(matches!(events.recv().await, Some(LinkEvent::Connecting { .. })));
        assert!(matches!(events.recv().await, Some(LinkEvent::Connected { .. })));
        assert!(matches!(
            events.recv().await,
            Some(LinkEvent::Disconnected {
                reason: DisconnectReason::Lost(_)
            })
        ));
    }

    #[tokio::test]
    async fn test_stop_cancels_blocked_send() {
        let backend = simulated();
        let manager = Arc::new(manager(backend.clone()));
        assert!(manager.connect("AA:BB:CC:01", None).await.unwrap());
        // Never read from the peer, so the pipe fills up
        let mut peer = backend.accept_peer().await.unwrap();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let data = vec![b'x'; 65536];
                manager.send(&data).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());

        manager.stop().unwrap();
        let sent = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent, Err(LinkError::Cancelled));

        // The transport is released: the peer drains the pipe and sees EOF
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), peer.stream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.len() < 65536);
    }

    #[tokio::test]
    async fn test_oversized_line_fails_pending_read() {
        let backend = simulated();
        let settings = LinkSettings {
            max_line_length: 8,
            ..LinkSettings::default()
        };
        let manager = Arc::new(LinkManager::new(backend.clone(), settings));
        assert!(manager.connect("AA:BB:CC:01", None).await.unwrap());
        let mut peer = backend.accept_peer().await.unwrap();

        peer.stream.write_all(b"ok\n").await.unwrap();
        assert_eq!(manager.read_line().await.unwrap(), "ok");

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.read_line().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        peer.stream.write_all(&[b'z'; 1000]).await.unwrap();
        let read = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(read, Err(LinkError::ConnectionLost(_))));
        assert!(!manager.is_connected().unwrap());
    }

    #[tokio::test]
    async fn test_permission_denied_on_connect() {
        let backend = Arc::new(
            SimulatedBackend::new(vec![SimulatedDevice::new("Pico A", "AA:BB:CC:01")])
                .with_permission(false),
        );
        let manager = manager(backend);

        assert!(matches!(
            manager.connect("AA:BB:CC:01", None).await,
            Err(LinkError::PermissionDenied(_))
        ));
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_writes_raw_bytes() {
        let backend = simulated();
        let manager = manager(backend.clone());
        assert!(manager.connect("AA:BB:CC:02", None).await.unwrap());
        let peer = backend.accept_peer().await.unwrap();

        assert!(manager.send(b"no newline").await.unwrap());
        assert!(manager.send(b" then one\n").await.unwrap());

        let mut reader = BufReader::new(peer.stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "no newline then one\n");
    }

    #[tokio::test]
    async fn test_custom_delimiter() {
        let backend = simulated();
        let settings = LinkSettings {
            line_delimiter: b"\r\n".to_vec(),
            ..LinkSettings::default()
        };
        let manager = LinkManager::new(backend.clone(), settings);
        assert!(manager.connect("AA:BB:CC:01", None).await.unwrap());
        let mut peer = backend.accept_peer().await.unwrap();

        peer.stream.write_all(b"a\nb\r\n").await.unwrap();
        assert_eq!(manager.read_line().await.unwrap(), "a\nb");
    }

    #[tokio::test]
    async fn test_discovery_single_scan() {
        let backend = Arc::new(
            SimulatedBackend::new(vec![
                SimulatedDevice::new("Pico A", "AA:BB:CC:01"),
                SimulatedDevice::new("Pico B", "AA:BB:CC:02"),
            ])
            .with_scan_delay(Duration::from_millis(20)),
        );
        let manager = manager(backend);
        let mut events = manager.take_event_receiver().unwrap();

        manager.start_discovery().unwrap();
        manager.start_discovery().unwrap();
        assert!(manager.is_discovering());
        assert!(manager.available_devices().unwrap().is_empty());

        wait_for_scan(&manager).await;
        let devices = manager.available_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "Pico A");

        assert_eq!(events.recv().await, Some(LinkEvent::DiscoveryStarted));
        assert!(matches!(
            events.recv().await,
            Some(LinkEvent::DiscoveryFinished { devices }) if devices.len() == 2
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_discovery_publishes_partial_scan() {
        let backend = Arc::new(
            SimulatedBackend::new(vec![
                SimulatedDevice::new("Pico A", "AA:BB:CC:01"),
                SimulatedDevice::new("Pico B", "AA:BB:CC:02"),
            ])
            .with_scan_delay(Duration::from_millis(50)),
        );
        let manager = manager(backend);

        manager.start_discovery().unwrap();
        tokio::time::sleep(Duration::from_millis(75)).await;
        manager.stop_discovery().unwrap();
        wait_for_scan(&manager).await;

        let devices = manager.available_devices().unwrap();
        assert_eq!(devices, vec![Device::new("Pico A", "AA:BB:CC:01")]);

        // Idle stop is a no-op
        manager.stop_discovery().unwrap();
    }

    #[tokio::test]
    async fn test_peer_name_from_catalog() {
        let manager = manager(simulated());
        manager.start_discovery().unwrap();
        wait_for_scan(&manager).await;

        assert!(manager.connect("aa:bb:cc:02", None).await.unwrap());
        assert_eq!(manager.connected_device().unwrap().name, "Pico B");
    }

    #[tokio::test]
    async fn test_permission_denied_on_init() {
        let backend = Arc::new(SimulatedBackend::new(Vec::new()).with_permission(false));
        let manager = manager(backend);
        assert!(matches!(
            manager.init().await,
            Err(LinkError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_backend_raises_everywhere() {
        let manager = LinkManager::new(Arc::new(UnsupportedBackend), LinkSettings::default());

        let unsupported = |r: Result<()>| matches!(r, Err(LinkError::PlatformUnsupported { .. }));
        assert!(unsupported(manager.init().await));
        assert!(unsupported(manager.start_discovery()));
        assert!(unsupported(manager.stop()));
        assert!(matches!(
            manager.connect("AA:BB", None).await,
            Err(LinkError::PlatformUnsupported { operation: "connect", .. })
        ));
        assert!(manager.is_connected().is_err());
        assert!(manager.available_devices().is_err());
        assert!(manager.send(b"x").await.is_err());
        assert!(manager.available().is_err());
        assert!(manager.read_line().await.is_err());
    }

    #[tokio::test]
    async fn test_events_for_session() {
        let manager = manager(simulated());
        let mut events = manager.take_event_receiver().unwrap();
        assert!(manager.take_event_receiver().is_none());

        assert!(manager.connect("AA:BB:CC:01", None).await.unwrap());
        manager.stop().unwrap();
        manager.stop().unwrap();

        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Connecting {
                address: "AA:BB:CC:01".into()
            })
        );
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Connected {
                device: Device::new("Pico A", "AA:BB:CC:01")
            })
        );
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Disconnected {
                reason: DisconnectReason::Stopped
            })
        );
        assert!(events.try_recv().is_err());
    }
}
