//! Request records (local side to remote)
//!
//! # Layout
//!
//! | Offset | Size | Field          |
//! |--------|------|----------------|
//! | 0      | 4    | size           |
//! | 4      | 4    | kind           |
//! | 8      | 8    | hint           |
//! | 16     | 8    | user_context   |
//! | 24     | 8    | user_context2  |
//! | 32     | 24   | params[3]      |
//! | 56     | 8    | file_name      |
//! | 64     | 16   | bufs[2]        |
//! | 80     | -    | trailing bytes |

use crate::layout::{Extent, push_trailing};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fsrelay_common::{Error, Hint, OpKind, Result};

/// Fixed request header size
pub const REQUEST_HEADER_SIZE: usize = 80;

const HINT_OFFSET: usize = 8;

/// Decoded fixed part of a request record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub size: u32,
    pub kind: OpKind,
    pub hint: Hint,
    pub user_context: u64,
    pub user_context2: u64,
    pub params: [u64; 3],
    pub file_name: Extent,
    pub bufs: [Extent; 2],
}

impl RequestHeader {
    fn decode(record: &[u8]) -> Result<Self> {
        if record.len() < REQUEST_HEADER_SIZE {
            return Err(Error::malformed(format!(
                "request of {} bytes is shorter than its header",
                record.len()
            )));
        }
        let mut src = &record[..REQUEST_HEADER_SIZE];
        let size = src.get_u32_le();
        let kind = OpKind::try_from(src.get_u32_le())?;
        let hint = Hint::from(src.get_u64_le());
        let user_context = src.get_u64_le();
        let user_context2 = src.get_u64_le();
        let params = [src.get_u64_le(), src.get_u64_le(), src.get_u64_le()];
        let file_name = Extent::read(&mut src);
        let bufs = [Extent::read(&mut src), Extent::read(&mut src)];
        Ok(Self {
            size,
            kind,
            hint,
            user_context,
            user_context2,
            params,
            file_name,
            bufs,
        })
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.size);
        dst.put_u32_le(self.kind.as_u32());
        dst.put_u64_le(self.hint.as_u64());
        dst.put_u64_le(self.user_context);
        dst.put_u64_le(self.user_context2);
        for param in self.params {
            dst.put_u64_le(param);
        }
        self.file_name.write(dst);
        for buf in self.bufs {
            buf.write(dst);
        }
    }
}

/// A validated request record.
///
/// Immutable once built; the queue stamps the hint with [`Request::with_hint`]
/// before the record is ever transmitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    header: RequestHeader,
    record: Bytes,
}

impl Request {
    /// Decode and validate a record copied out of a shared buffer
    pub fn parse(record: &[u8]) -> Result<Self> {
        Self::from_bytes(Bytes::copy_from_slice(record))
    }

    /// Decode and validate an owned record
    pub fn from_bytes(mut record: Bytes) -> Result<Self> {
        let header = RequestHeader::decode(&record)?;
        let size = header.size as usize;
        if size < REQUEST_HEADER_SIZE || size > record.len() {
            return Err(Error::malformed(format!(
                "request size {size} outside [{REQUEST_HEADER_SIZE}, {}]",
                record.len()
            )));
        }
        record.truncate(size);
        let request = Self { header, record };
        request.buf(header.file_name)?;
        for buf in header.bufs {
            request.buf(buf)?;
        }
        Ok(request)
    }

    #[must_use]
    pub const fn header(&self) -> &RequestHeader {
        &self.header
    }

    #[must_use]
    pub const fn kind(&self) -> OpKind {
        self.header.kind
    }

    #[must_use]
    pub const fn hint(&self) -> Hint {
        self.header.hint
    }

    #[must_use]
    pub const fn param(&self, index: usize) -> u64 {
        self.header.params[index]
    }

    /// Encoded record bytes (unpadded)
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.record
    }

    /// Record length in bytes (unpadded)
    #[must_use]
    pub fn len(&self) -> usize {
        self.record.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record.is_empty()
    }

    /// Bytes addressed by an extent of this record
    pub fn buf(&self, extent: Extent) -> Result<&[u8]> {
        extent.resolve(&self.record[REQUEST_HEADER_SIZE..])
    }

    /// One of the two general-purpose trailing fields
    pub fn field(&self, index: usize) -> Result<&[u8]> {
        self.buf(self.header.bufs[index])
    }

    /// One of the two general-purpose trailing fields, as text
    pub fn field_str(&self, index: usize) -> Result<&str> {
        self.header.bufs[index].resolve_str(&self.record[REQUEST_HEADER_SIZE..])
    }

    /// File name addressed by the request
    pub fn file_name(&self) -> Result<&str> {
        self.header.file_name.resolve_str(&self.record[REQUEST_HEADER_SIZE..])
    }

    /// Copy of this record with a correlation hint stamped in
    #[must_use]
    pub fn with_hint(&self, hint: Hint) -> Self {
        let mut record = BytesMut::from(&self.record[..]);
        record[HINT_OFFSET..HINT_OFFSET + 8].copy_from_slice(&hint.as_u64().to_le_bytes());
        let mut header = self.header;
        header.hint = hint;
        Self {
            header,
            record: record.freeze(),
        }
    }
}

/// Builder for request records
#[derive(Debug)]
pub struct RequestBuilder {
    kind: OpKind,
    user_context: u64,
    user_context2: u64,
    params: [u64; 3],
    file_name: Option<String>,
    bufs: [Option<Bytes>; 2],
}

impl RequestBuilder {
    #[must_use]
    pub const fn new(kind: OpKind) -> Self {
        Self {
            kind,
            user_context: 0,
            user_context2: 0,
            params: [0; 3],
            file_name: None,
            bufs: [None, None],
        }
    }

    #[must_use]
    pub fn user_context(mut self, context: u64, context2: u64) -> Self {
        self.user_context = context;
        self.user_context2 = context2;
        self
    }

    #[must_use]
    pub fn param(mut self, index: usize, value: u64) -> Self {
        self.params[index] = value;
        self
    }

    #[must_use]
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn field(mut self, index: usize, data: impl Into<Bytes>) -> Self {
        self.bufs[index] = Some(data.into());
        self
    }

    /// Encode the record with an unassigned hint
    pub fn build(self) -> Result<Request> {
        let mut trailing = BytesMut::new();
        let file_name = match &self.file_name {
            Some(name) => push_trailing(&mut trailing, name.as_bytes())?,
            None => Extent::EMPTY,
        };
        let mut bufs = [Extent::EMPTY; 2];
        for (slot, data) in bufs.iter_mut().zip(&self.bufs) {
            if let Some(data) = data {
                *slot = push_trailing(&mut trailing, data)?;
            }
        }

        let size = u32::try_from(REQUEST_HEADER_SIZE + trailing.len())
            .map_err(|_| Error::invalid_parameter("request too large"))?;
        let header = RequestHeader {
            size,
            kind: self.kind,
            hint: Hint::NONE,
            user_context: self.user_context,
            user_context2: self.user_context2,
            params: self.params,
            file_name,
            bufs,
        };

        let mut record = BytesMut::with_capacity(size as usize);
        header.encode(&mut record);
        debug_assert_eq!(record.len(), REQUEST_HEADER_SIZE);
        record.extend_from_slice(&trailing);
        Ok(Request {
            header,
            record: record.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Request {
        RequestBuilder::new(OpKind::QueryDirectory)
            .user_context(7, 8)
            .param(0, 4096)
            .file_name("\\docs")
            .field(0, Bytes::from_static(b"*.txt"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_and_parse() {
        let request = sample();
        let parsed = Request::parse(request.as_bytes()).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.kind(), OpKind::QueryDirectory);
        assert_eq!(parsed.param(0), 4096);
        assert_eq!(parsed.header().user_context2, 8);
        assert_eq!(parsed.file_name().unwrap(), "\\docs");
        assert_eq!(parsed.field(0).unwrap(), b"*.txt");
        assert_eq!(parsed.field(1).unwrap(), b"");
    }

    #[test]
    fn test_with_hint_patches_record() {
        let hint = Hint::from_parts(3, 9);
        let request = sample().with_hint(hint);
        assert_eq!(request.hint(), hint);
        assert_eq!(Request::parse(request.as_bytes()).unwrap().hint(), hint);
    }

    #[test]
    fn test_parse_rejects_short_and_oversized() {
        let request = sample();
        assert!(Request::parse(&request.as_bytes()[..40]).is_err());

        let mut bytes = request.as_bytes().to_vec();
        let oversized = (bytes.len() as u32 + 1).to_le_bytes();
        bytes[0..4].copy_from_slice(&oversized);
        assert!(Request::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_extent_outside_record() {
        let mut bytes = sample().as_bytes().to_vec();
        // bufs[0].size
        bytes[68..72].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(Request::parse(&bytes), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let mut bytes = sample().as_bytes().to_vec();
        bytes[4..8].copy_from_slice(&999u32.to_le_bytes());
        assert!(Request::parse(&bytes).is_err());
    }
}
