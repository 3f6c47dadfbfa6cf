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

//! Delimiter-based line extraction for inbound link bytes.

use tracing::warn;

/// Default line delimiter.
pub const DEFAULT_DELIMITER: &[u8] = b"\n";

/// Default maximum length of a single line, excluding the delimiter.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Accumulates inbound bytes and splits them into delimiter-terminated lines.
#[derive(Debug)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    delimiter: Vec<u8>,
    max_line_length: usize,
    /// Offset up to which the buffer is known not to contain a delimiter.
    searched: usize,
}

impl LineBuffer {
    /// Create a line buffer with the given delimiter.
    ///
    /// An empty delimiter falls back to [`DEFAULT_DELIMITER`].
    pub fn new(delimiter: &[u8], max_line_length: usize) -> Self {
        let delimiter = if delimiter.is_empty() {
            warn!("Empty line delimiter, using newline");
            DEFAULT_DELIMITER.to_vec()
        } else {
            delimiter.to_vec()
        };

        Self {
            buffer: Vec::with_capacity(1024),
            delimiter,
            max_line_length,
            searched: 0,
        }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed by a line read.
    pub fn available(&self) -> usize {
        self.buffer.len()
    }

    /// Remove and return the next complete line, delimiter stripped.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.find_delimiter()?;
        let mut line: Vec<u8> = self.buffer.drain(..pos + self.delimiter.len()).collect();
        line.truncate(pos);
        self.searched = 0;
        Some(line)
    }

    /// Whether the unterminated tail of the buffer can no longer fit in a line.
    ///
    /// Bytes past the limit are tolerated while they may still be the start
    /// of a delimiter.
    pub fn is_overflowing(&self) -> bool {
        let partial = self.partial_line();
        if partial.len() <= self.max_line_length {
            return false;
        }
        !self.delimiter.starts_with(&partial[self.max_line_length..])
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.searched = 0;
    }

    /// Bytes after the last delimiter in the buffer.
    fn partial_line(&self) -> &[u8] {
        let width = self.delimiter.len();
        let start = self
            .buffer
            .windows(width)
            .rposition(|w| w == self.delimiter.as_slice())
            .map_or(0, |p| p + width);
        &self.buffer[start..]
    }

    fn find_delimiter(&mut self) -> Option<usize> {
        let width = self.delimiter.len();
        if self.buffer.len() < width {
            return None;
        }

        let found = self.buffer[self.searched..]
            .windows(width)
            .position(|w| w == self.delimiter.as_slice())
            .map(|p| p + self.searched);

        if found.is_none() {
            // A delimiter may straddle the end of the current buffer
            self.searched = self.buffer.len() + 1 - width;
        }
        found
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER, DEFAULT_MAX_LINE_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut buf = LineBuffer::default();
        buf.push(b"PONG\n");
        assert_eq!(buf.take_line(), Some(b"PONG".to_vec()));
        assert_eq!(buf.available(), 0);
        assert_eq!(buf.take_line(), None);
    }

    #[test]
    fn test_available_tracks_unconsumed_bytes() {
        let mut buf = LineBuffer::default();
        buf.push(b"abc");
        assert_eq!(buf.available(), 3);
        assert_eq!(buf.take_line(), None);

        buf.push(b"\nde");
        assert_eq!(buf.available(), 6);
        assert_eq!(buf.take_line(), Some(b"abc".to_vec()));
        assert_eq!(buf.available(), 2);
    }

    #[test]
    fn test_multiple_lines_in_one_push() {
        let mut buf = LineBuffer::default();
        buf.push(b"one\ntwo\n\nthree");
        assert_eq!(buf.take_line(), Some(b"one".to_vec()));
        assert_eq!(buf.take_line(), Some(b"two".to_vec()));
        assert_eq!(buf.take_line(), Some(Vec::new()));
        assert_eq!(buf.take_line(), None);
        assert_eq!(buf.available(), 5);
    }

    #[test]
    fn test_multi_byte_delimiter_split_across_pushes() {
        let mut buf = LineBuffer::new(b"\r\n", 64);
        buf.push(b"hello\r");
        assert_eq!(buf.take_line(), None);
        buf.push(b"\nworld\r\n");
        assert_eq!(buf.take_line(), Some(b"hello".to_vec()));
        assert_eq!(buf.take_line(), Some(b"world".to_vec()));
    }

    #[test]
    fn test_carriage_return_kept_with_newline_delimiter() {
        let mut buf = LineBuffer::default();
        buf.push(b"data\r\n");
        assert_eq!(buf.take_line(), Some(b"data\r".to_vec()));
    }

    #[test]
    fn test_empty_delimiter_falls_back() {
        let mut buf = LineBuffer::new(b"", 16);
        buf.push(b"a\nb");
        assert_eq!(buf.take_line(), Some(b"a".to_vec()));
    }

    #[test]
    fn test_overflow_detection() {
        let mut buf = LineBuffer::new(b"\n", 4);
        buf.push(b"abcd");
        assert!(!buf.is_overflowing());
        buf.push(b"e");
        assert!(buf.is_overflowing());

        buf.clear();
        buf.push(b"abcdefgh\n");
        assert!(!buf.is_overflowing());
    }

    #[test]
    fn test_overflow_behind_complete_line() {
        let mut buf = LineBuffer::new(b"\n", 8);
        buf.push(b"ok\n");
        buf.push(&[b'z'; 9]);
        assert!(buf.is_overflowing());

        // Consuming the short line leaves the oversized tail flagged
        assert_eq!(buf.take_line(), Some(b"ok".to_vec()));
        assert!(buf.is_overflowing());
    }

    #[test]
    fn test_split_crlf_at_limit_is_not_overflow() {
        let mut buf = LineBuffer::new(b"\r\n", 4);
        buf.push(b"abcd\r");
        assert!(!buf.is_overflowing());
        buf.push(b"\n");
        assert_eq!(buf.take_line(), Some(b"abcd".to_vec()));

        buf.push(b"abcde");
        assert!(buf.is_overflowing());
    }

    #[test]
    fn test_binary_payload_preserved() {
        let mut buf = LineBuffer::default();
        let payload = [0x00u8, 0xff, 0x7f, 0x80];
        buf.push(&payload);
        buf.push(b"\n");
        assert_eq!(buf.take_line(), Some(payload.to_vec()));
    }
}
