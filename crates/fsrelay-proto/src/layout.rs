//! Record alignment and trailing-region extents

use bytes::{Buf, BufMut};
use fsrelay_common::{Error, Result};

/// Every record (and directory entry) starts on this boundary
pub const ALIGNMENT: usize = 8;

/// Round `n` up to the next record boundary
#[must_use]
pub const fn align_up(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// An `{offset, size}` pair addressing bytes in a record's trailing region.
///
/// Offsets are relative to the start of the trailing region. `{0, 0}` means
/// the field is absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extent {
    pub offset: u32,
    pub size: u32,
}

impl Extent {
    pub const EMPTY: Self = Self { offset: 0, size: 0 };

    #[must_use]
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.size == 0
    }

    /// Resolve the extent against a trailing region.
    ///
    /// This is the only place trailing bytes are sliced.
    pub fn resolve(self, trailing: &[u8]) -> Result<&[u8]> {
        if self.is_empty() {
            return Ok(&[]);
        }
        let start = self.offset as usize;
        let end = start
            .checked_add(self.size as usize)
            .ok_or_else(|| Error::malformed("extent overflows"))?;
        trailing.get(start..end).ok_or_else(|| {
            Error::malformed(format!(
                "extent {}+{} outside trailing region of {} bytes",
                self.offset,
                self.size,
                trailing.len()
            ))
        })
    }

    /// Resolve the extent as UTF-8 text
    pub fn resolve_str(self, trailing: &[u8]) -> Result<&str> {
        std::str::from_utf8(self.resolve(trailing)?)
            .map_err(|_| Error::malformed("extent is not valid UTF-8"))
    }

    pub(crate) fn read(src: &mut &[u8]) -> Self {
        let offset = src.get_u32_le();
        let size = src.get_u32_le();
        Self { offset, size }
    }

    pub(crate) fn write(self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.offset);
        dst.put_u32_le(self.size);
    }
}

/// Append `data` to a trailing region under construction.
///
/// Each field starts 8-aligned within the region.
pub(crate) fn push_trailing(trailing: &mut bytes::BytesMut, data: &[u8]) -> Result<Extent> {
    if data.is_empty() {
        return Ok(Extent::EMPTY);
    }
    let offset = align_up(trailing.len());
    trailing.resize(offset, 0);
    trailing.extend_from_slice(data);

    let offset = u32::try_from(offset).map_err(|_| Error::invalid_parameter("record too large"))?;
    let size = u32::try_from(data.len()).map_err(|_| Error::invalid_parameter("field too large"))?;
    Ok(Extent { offset, size })
}
