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

//! Device catalog and discovery lifecycle.
//!
//! Backends push devices into the catalog while a scan is running. Callers
//! only ever see the snapshot of the last completed scan.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use super::device::Device;

/// Discovery lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Scanning,
}

#[derive(Debug)]
struct CatalogInner {
    state: DiscoveryState,
    /// Results of the last completed scan.
    snapshot: Vec<Device>,
    /// Devices collected by the running scan.
    pending: Vec<Device>,
    /// Incremented for every scan; stale sinks are ignored.
    scan_id: u64,
}

/// Catalog of discovered devices.
#[derive(Debug)]
pub struct DeviceCatalog {
    inner: RwLock<CatalogInner>,
}

impl Default for DeviceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CatalogInner {
                state: DiscoveryState::Idle,
                snapshot: Vec::new(),
                pending: Vec::new(),
                scan_id: 0,
            }),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.inner.read().state
    }

    pub fn is_scanning(&self) -> bool {
        self.state() == DiscoveryState::Scanning
    }

    /// Start a new scan.
    ///
    /// Returns the scan ID, or `None` if a scan is already running.
    pub fn begin_scan(&self) -> Option<u64> {
        let mut inner = self.inner.write();
        if inner.state == DiscoveryState::Scanning {
            return None;
        }
        inner.scan_id += 1;
        inner.state = DiscoveryState::Scanning;
        inner.pending.clear();
        debug!("Scan {} started", inner.scan_id);
        Some(inner.scan_id)
    }

    /// Record a device found by scan `scan_id`.
    ///
    /// Devices are kept in first-seen order. A repeat sighting of the same
    /// address only fills in a name that was previously empty.
    pub fn record(&self, scan_id: u64, device: Device) -> bool {
        let mut inner = self.inner.write();
        if inner.state != DiscoveryState::Scanning || inner.scan_id != scan_id {
            return false;
        }

        if let Some(existing) = inner
            .pending
            .iter_mut()
            .find(|d| d.matches_address(&device.address))
        {
            if existing.name.is_empty() && !device.name.is_empty() {
                existing.name = device.name;
            }
            return false;
        }

        inner.pending.push(device);
        true
    }

    /// Publish the running scan's results as the new snapshot.
    ///
    /// Returns the number of devices published, or `None` if `scan_id` is
    /// not the running scan.
    pub fn finish_scan(&self, scan_id: u64) -> Option<usize> {
        let mut inner = self.inner.write();
        if inner.state != DiscoveryState::Scanning || inner.scan_id != scan_id {
            return None;
        }
        inner.snapshot = std::mem::take(&mut inner.pending);
        inner.state = DiscoveryState::Idle;
        debug!("Scan {} finished with {} devices", scan_id, inner.snapshot.len());
        Some(inner.snapshot.len())
    }

    /// Abandon the running scan, keeping the previous snapshot.
    pub fn abort_scan(&self, scan_id: u64) {
        let mut inner = self.inner.write();
        if inner.state == DiscoveryState::Scanning && inner.scan_id == scan_id {
            inner.pending.clear();
            inner.state = DiscoveryState::Idle;
            debug!("Scan {} aborted", scan_id);
        }
    }

    /// ID of the running scan, if any.
    pub fn current_scan(&self) -> Option<u64> {
        let inner = self.inner.read();
        (inner.state == DiscoveryState::Scanning).then_some(inner.scan_id)
    }

    /// Snapshot of the last completed scan.
    pub fn snapshot(&self) -> Vec<Device> {
        self.inner.read().snapshot.clone()
    }

    /// Find a device by address in the completed snapshot, then in the
    /// running scan.
    pub fn lookup(&self, address: &str) -> Option<Device> {
        let inner = self.inner.read();
        inner
            .snapshot
            .iter()
            .chain(inner.pending.iter())
            .find(|d| d.matches_address(address))
            .cloned()
    }
}

/// Handle given to a backend for reporting devices during one scan.
#[derive(Debug, Clone)]
pub struct ScanSink {
    catalog: Arc<DeviceCatalog>,
    scan_id: u64,
}

impl ScanSink {
    pub fn new(catalog: Arc<DeviceCatalog>, scan_id: u64) -> Self {
        Self { catalog, scan_id }
    }

    /// Report a found device.
    pub fn found(&self, device: Device) {
        if self.catalog.record(self.scan_id, device.clone()) {
            debug!("Discovered {}", device);
        }
    }
}
