//! Walking and filling packed record buffers
//!
//! A record in an inbound buffer is consumable only if its header fits,
//! its size field covers at least the header, and the record ends inside the
//! buffer. A framing failure means the next record cannot be located, so
//! the walk ends there.

use crate::layout::align_up;
use fsrelay_common::{Error, Result};
use tracing::warn;

/// Iterator over the records packed in a buffer.
///
/// Yields each record trimmed to its `size` field. On a framing failure it
/// yields one error and then stops.
#[derive(Debug)]
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
    header_size: usize,
    done: bool,
}

impl<'a> RecordReader<'a> {
    /// Walk `buf`, requiring at least `header_size` bytes per record
    #[must_use]
    pub const fn new(buf: &'a [u8], header_size: usize) -> Self {
        Self {
            buf,
            pos: 0,
            header_size,
            done: false,
        }
    }

    /// Bytes consumed so far
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let rest = &self.buf[self.pos..];
        if rest.len() < self.header_size {
            // trailing padding or an empty buffer
            self.done = true;
            return None;
        }

        let mut size_field = [0u8; 4];
        size_field.copy_from_slice(&rest[..4]);
        let size = u32::from_le_bytes(size_field) as usize;
        if size < self.header_size || size > rest.len() {
            self.done = true;
            warn!(
                "record at {} has size {size} (header {}, remaining {}); abandoning buffer",
                self.pos,
                self.header_size,
                rest.len()
            );
            return Some(Err(Error::malformed(format!(
                "record at {} has invalid size {size}",
                self.pos
            ))));
        }

        let record = &rest[..size];
        self.pos = (self.pos + align_up(size)).min(self.buf.len());
        Some(Ok(record))
    }
}

/// Appends aligned records to an outbound buffer
#[derive(Debug)]
pub struct RecordWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> RecordWriter<'a> {
    #[must_use]
    pub const fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    /// Bytes produced so far (including alignment padding)
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Space still available
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Whether a record of `size` bytes fits in the space left
    #[must_use]
    pub const fn fits(&self, size: usize) -> bool {
        size <= self.remaining()
    }

    /// Copy a record into the buffer and pad it to the next boundary
    pub fn push(&mut self, record: &[u8]) -> Result<()> {
        if !self.fits(record.len()) {
            return Err(Error::BufferTooSmall {
                required: record.len(),
                available: self.remaining(),
            });
        }
        let start = self.len;
        let end = start + record.len();
        self.buf[start..end].copy_from_slice(record);

        let padded = (start + align_up(record.len())).min(self.buf.len());
        self.buf[end..padded].fill(0);
        self.len = padded;
        Ok(())
    }
}
