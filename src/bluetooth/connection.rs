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

//! Connection state, events and the inbound reader.

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::device::Device;
use super::line_buffer::LineBuffer;
use crate::error::{LinkError, Result};

/// Read chunk size for the inbound reader.
const READ_CHUNK_SIZE: usize = 1024;

/// State of the connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Explicit stop.
    Stopped,
    /// Transport failure.
    Lost(String),
}

/// Events emitted by the link manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A scan started.
    DiscoveryStarted,
    /// A scan completed and its results were published.
    DiscoveryFinished { devices: Vec<Device> },
    /// Connection attempt started.
    Connecting { address: String },
    /// Connection established.
    Connected { device: Device },
    /// Connection attempt failed.
    ConnectFailed { address: String, reason: String },
    /// Connection closed.
    Disconnected { reason: DisconnectReason },
}

/// Non-blocking event emitter.
///
/// Events are dropped when nobody drains the receiver.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<LinkEvent>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::Sender<LinkEvent>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("Dropping link event: {}", e);
        }
    }
}

struct InboundState {
    buffer: LineBuffer,
    closed: Option<LinkError>,
}

/// Inbound byte queue shared between the reader task and callers.
pub(crate) struct Inbound {
    state: Mutex<InboundState>,
    signal: watch::Sender<u64>,
}

impl Inbound {
    pub(crate) fn new(buffer: LineBuffer) -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            state: Mutex::new(InboundState {
                buffer,
                closed: None,
            }),
            signal,
        }
    }

    fn notify(&self) {
        self.signal.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Append received bytes. Returns `false` if a line overflowed the limit.
    pub(crate) fn push(&self, data: &[u8]) -> bool {
        let overflowing = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return true;
            }
            state.buffer.push(data);
            state.buffer.is_overflowing()
        };
        self.notify();
        !overflowing
    }

    /// Close the queue, discarding buffered bytes. The first close wins.
    pub(crate) fn close(&self, error: LinkError) {
        {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            state.buffer.clear();
            state.closed = Some(error);
        }
        self.notify();
    }

    pub(crate) fn available(&self) -> usize {
        self.state.lock().buffer.available()
    }

    /// Wait until the queue is closed and return the close reason.
    pub(crate) async fn closed(&self) -> LinkError {
        let mut rx = self.signal.subscribe();
        loop {
            let closed = self.state.lock().closed.clone();
            if let Some(err) = closed {
                return err;
            }
            if rx.changed().await.is_err() {
                return LinkError::ConnectionLost("inbound queue dropped".into());
            }
        }
    }

    /// Wait for the next complete line.
    pub(crate) async fn read_line(&self) -> Result<Vec<u8>> {
        let mut rx = self.signal.subscribe();
        loop {
            {
                let mut state = self.state.lock();
                if let Some(line) = state.buffer.take_line() {
                    return Ok(line);
                }
                if let Some(err) = &state.closed {
                    return Err(err.clone());
                }
            }

            if rx.changed().await.is_err() {
                return Err(LinkError::ConnectionLost("inbound queue dropped".into()));
            }
        }
    }
}

/// Pump bytes from `reader` into `inbound` until the transport fails.
///
/// Returns the reason the link was lost.
pub(crate) async fn run_reader<R>(mut reader: R, inbound: &Inbound) -> String
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                info!("Connection closed by remote");
                return "closed by remote".to_string();
            }
            Ok(n) => {
                debug!("Received {} bytes", n);
                if !inbound.push(&chunk[..n]) {
                    warn!("Inbound line exceeds maximum length");
                    return "line exceeds maximum length".to_string();
                }
            }
            Err(e) => {
                warn!("Read error: {}", e);
                return e.to_string();
            }
        }
    }
}
