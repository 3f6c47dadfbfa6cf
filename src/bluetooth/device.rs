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

//! Remote device descriptor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator used in `NAME|ADDRESS` device records.
pub const RECORD_SEPARATOR: char = '|';

/// A discoverable remote Bluetooth device.
///
/// The address is the identity key. The default value (empty name and
/// address) is the "no peer" sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub address: String,
}

impl Device {
    /// Create a new device descriptor.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// The empty sentinel returned when no peer is connected.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether this is the empty sentinel.
    pub fn is_none(&self) -> bool {
        self.name.is_empty() && self.address.is_empty()
    }

    /// Parse a `NAME|ADDRESS` record.
    ///
    /// The name may itself contain the separator; the address is everything
    /// after the last one. Returns `None` when no separator is present.
    pub fn from_record(record: &str) -> Option<Self> {
        let (name, address) = record.rsplit_once(RECORD_SEPARATOR)?;
        Some(Self::new(name, address.trim()))
    }

    /// Render as a `NAME|ADDRESS` record.
    pub fn to_record(&self) -> String {
        self.to_string()
    }

    /// Whether `address` refers to this device, ignoring case.
    pub fn matches_address(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, RECORD_SEPARATOR, self.address)
    }
}
