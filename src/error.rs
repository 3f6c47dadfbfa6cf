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

//! Error types for link operations.

use thiserror::Error;

/// Result type alias for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors raised by the link manager and its backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Operation is not implemented by the active backend.
    #[error("{operation} is not supported by the {backend} backend")]
    PlatformUnsupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// Bluetooth access was not granted by the OS.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Operation is not valid in the current session state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// I/O attempted without an active session.
    #[error("Not connected")]
    NotConnected,

    /// Transport failed during an in-flight operation.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A blocking call was aborted by an explicit stop.
    #[error("Operation cancelled")]
    Cancelled,

    /// Backend failure that is not a capability or permission problem.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => LinkError::PermissionDenied(e.to_string()),
            _ => LinkError::Backend(e.to_string()),
        }
    }
}
