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

//! Bluetooth link module.
//!
//! Device discovery, a single serial session and line-buffered I/O over a
//! pluggable backend.

mod backend;
#[cfg(all(feature = "bluez", target_os = "linux"))]
mod bluez;
mod connection;
mod device;
mod discovery;
mod line_buffer;
mod manager;
mod simulated;

pub use backend::{
    create_backend, BackendKind, Capability, Connection, LinkBackend, LinkStream,
    UnsupportedBackend,
};
#[cfg(all(feature = "bluez", target_os = "linux"))]
pub use bluez::{BluezBackend, SPP_UUID};
pub use connection::{ConnectionState, DisconnectReason, LinkEvent};
pub use device::Device;
pub use discovery::{DeviceCatalog, DiscoveryState, ScanSink};
pub use line_buffer::{LineBuffer, DEFAULT_DELIMITER, DEFAULT_MAX_LINE_LENGTH};
pub use manager::{LinkManager, LinkSettings};
pub use simulated::{SimulatedBackend, SimulatedDevice, SimulatedPeer};
