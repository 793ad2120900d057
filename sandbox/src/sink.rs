//! This module implements the bounded capture sink for container output
//! streams.
//!

use std::io::Write;

/// Maximum number of bytes captured from a single output stream. Bytes past
/// the ceiling are discarded without error.
pub const OUTPUT_LIMIT: usize = 100 * 1024 * 1024;

/// An append-only sink with a fixed capacity.
///
/// Every write appends at most the remaining room and reports the original
/// input length as consumed, so an upstream copy loop never blocks or errors
/// when the captured stream overflows.
pub struct BoundedWriter {
    /// Captured bytes.
    buf: Vec<u8>,

    /// Maximum number of bytes retained in `buf`.
    limit: usize
}

impl BoundedWriter {
    /// Create a new `BoundedWriter` retaining at most `limit` bytes.
    pub fn new(limit: usize) -> BoundedWriter {
        BoundedWriter {
            buf: Vec::new(),
            limit
        }
    }

    /// Create a new `BoundedWriter` with the standard output stream ceiling.
    pub fn with_output_limit() -> BoundedWriter {
        BoundedWriter::new(OUTPUT_LIMIT)
    }

    /// Number of bytes retained so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Determine whether nothing has been retained yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the sink and take the retained bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for BoundedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let room = self.limit - self.buf.len();
        let retained = std::cmp::min(room, data.len());
        self.buf.extend_from_slice(&data[..retained]);

        // Report the full input as consumed even when part of it has been
        // discarded.
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
