//! Response records (remote side to local)
//!
//! # Layout
//!
//! | Offset | Size | Field          |
//! |--------|------|----------------|
//! | 0      | 4    | size           |
//! | 4      | 4    | kind           |
//! | 8      | 8    | hint           |
//! | 16     | 4    | status         |
//! | 20     | 4    | flags          |
//! | 24     | 8    | information    |
//! | 32     | 24   | params[3]      |
//! | 56     | 16   | bufs[2]        |
//! | 72     | -    | trailing bytes |

use crate::layout::{Extent, push_trailing};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fsrelay_common::{Error, Hint, OpKind, Result, Status};

/// Fixed response header size
pub const RESPONSE_HEADER_SIZE: usize = 72;

/// Decoded fixed part of a response record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseHeader {
    pub size: u32,
    pub kind: OpKind,
    pub hint: Hint,
    pub status: Status,
    pub flags: u32,
    pub information: u64,
    pub params: [u64; 3],
    pub bufs: [Extent; 2],
}

impl ResponseHeader {
    fn decode(record: &[u8]) -> Result<Self> {
        if record.len() < RESPONSE_HEADER_SIZE {
            return Err(Error::malformed(format!(
                "response of {} bytes is shorter than its header",
                record.len()
            )));
        }
        let mut src = &record[..RESPONSE_HEADER_SIZE];
        let size = src.get_u32_le();
        let kind = OpKind::try_from(src.get_u32_le())?;
        let hint = Hint::from(src.get_u64_le());
        let status = Status::new(src.get_u32_le());
        let flags = src.get_u32_le();
        let information = src.get_u64_le();
        let params = [src.get_u64_le(), src.get_u64_le(), src.get_u64_le()];
        let bufs = [Extent::read(&mut src), Extent::read(&mut src)];
        Ok(Self {
            size,
            kind,
            hint,
            status,
            flags,
            information,
            params,
            bufs,
        })
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.size);
        dst.put_u32_le(self.kind.as_u32());
        dst.put_u64_le(self.hint.as_u64());
        dst.put_u32_le(self.status.as_u32());
        dst.put_u32_le(self.flags);
        dst.put_u64_le(self.information);
        for param in self.params {
            dst.put_u64_le(param);
        }
        for buf in self.bufs {
            buf.write(dst);
        }
    }
}

/// A validated response record, owned so it can outlive the inbound buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    header: ResponseHeader,
    record: Bytes,
}

impl Response {
    /// Decode and validate a record copied out of a shared buffer
    pub fn parse(record: &[u8]) -> Result<Self> {
        let header = ResponseHeader::decode(record)?;
        let size = header.size as usize;
        if size < RESPONSE_HEADER_SIZE || size > record.len() {
            return Err(Error::malformed(format!(
                "response size {size} outside [{RESPONSE_HEADER_SIZE}, {}]",
                record.len()
            )));
        }
        let response = Self {
            header,
            record: Bytes::copy_from_slice(&record[..size]),
        };
        for buf in header.bufs {
            response.buf(buf)?;
        }
        Ok(response)
    }

    #[must_use]
    pub const fn header(&self) -> &ResponseHeader {
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
    pub const fn status(&self) -> Status {
        self.header.status
    }

    #[must_use]
    pub const fn information(&self) -> u64 {
        self.header.information
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
        extent.resolve(&self.record[RESPONSE_HEADER_SIZE..])
    }

    /// One of the two general-purpose trailing fields
    pub fn field(&self, index: usize) -> Result<&[u8]> {
        self.buf(self.header.bufs[index])
    }

    /// A trailing field as a zero-copy slice of the record
    pub fn field_bytes(&self, index: usize) -> Result<Bytes> {
        let extent = self.header.bufs[index];
        let data = self.buf(extent)?;
        let start = RESPONSE_HEADER_SIZE + extent.offset as usize;
        Ok(self.record.slice(start..start + data.len()))
    }

    /// Convert a failure status into an error
    pub fn into_result(self) -> Result<Self> {
        if self.status().is_error() {
            return Err(Error::from_status(self.status()));
        }
        Ok(self)
    }
}

/// Builder for response records
#[derive(Debug)]
pub struct ResponseBuilder {
    kind: OpKind,
    hint: Hint,
    status: Status,
    information: u64,
    params: [u64; 3],
    bufs: [Option<Bytes>; 2],
}

impl ResponseBuilder {
    #[must_use]
    pub const fn new(kind: OpKind, hint: Hint) -> Self {
        Self {
            kind,
            hint,
            status: Status::SUCCESS,
            information: 0,
            params: [0; 3],
            bufs: [None, None],
        }
    }

    #[must_use]
    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn information(mut self, information: u64) -> Self {
        self.information = information;
        self
    }

    #[must_use]
    pub fn param(mut self, index: usize, value: u64) -> Self {
        self.params[index] = value;
        self
    }

    #[must_use]
    pub fn field(mut self, index: usize, data: impl Into<Bytes>) -> Self {
        self.bufs[index] = Some(data.into());
        self
    }

    pub fn build(self) -> Result<Response> {
        let mut trailing = BytesMut::new();
        let mut bufs = [Extent::EMPTY; 2];
        for (slot, data) in bufs.iter_mut().zip(&self.bufs) {
            if let Some(data) = data {
                *slot = push_trailing(&mut trailing, data)?;
            }
        }

        let size = u32::try_from(RESPONSE_HEADER_SIZE + trailing.len())
            .map_err(|_| Error::invalid_parameter("response too large"))?;
        let header = ResponseHeader {
            size,
            kind: self.kind,
            hint: self.hint,
            status: self.status,
            flags: 0,
            information: self.information,
            params: self.params,
            bufs,
        };

        let mut record = BytesMut::with_capacity(size as usize);
        header.encode(&mut record);
        debug_assert_eq!(record.len(), RESPONSE_HEADER_SIZE);
        record.extend_from_slice(&trailing);
        Ok(Response {
            header,
            record: record.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_parse() {
        let hint = Hint::from_parts(1, 1);
        let response = ResponseBuilder::new(OpKind::QuerySecurity, hint)
            .information(12)
            .field(0, Bytes::from_static(b"descriptor!!"))
            .build()
            .unwrap();

        let parsed = Response::parse(response.as_bytes()).unwrap();
        assert_eq!(parsed, response);
        assert_eq!(parsed.hint(), hint);
        assert_eq!(parsed.status(), Status::SUCCESS);
        assert_eq!(parsed.information(), 12);
        assert_eq!(parsed.field(0).unwrap(), b"descriptor!!");
        assert_eq!(&parsed.field_bytes(0).unwrap()[..], b"descriptor!!");
    }

    #[test]
    fn test_parse_ignores_trailing_padding() {
        let response = ResponseBuilder::new(OpKind::Close, Hint::from_parts(2, 1))
            .build()
            .unwrap();
        let mut bytes = response.as_bytes().to_vec();
        bytes.extend_from_slice(&[0xaa; 16]);
        assert_eq!(Response::parse(&bytes).unwrap().len(), RESPONSE_HEADER_SIZE);
    }

    #[test]
    fn test_into_result() {
        let ok = ResponseBuilder::new(OpKind::Read, Hint::NONE).build().unwrap();
        assert!(ok.into_result().is_ok());

        let denied = ResponseBuilder::new(OpKind::Read, Hint::NONE)
            .status(Status::ACCESS_DENIED)
            .build()
            .unwrap();
        assert_eq!(
            denied.into_result().unwrap_err(),
            Error::Remote(Status::ACCESS_DENIED)
        );
    }

    #[test]
    fn test_parse_rejects_undersized_size_field() {
        let response = ResponseBuilder::new(OpKind::Close, Hint::NONE).build().unwrap();
        let mut bytes = response.as_bytes().to_vec();
        bytes[0..4].copy_from_slice(&8u32.to_le_bytes());
        assert!(Response::parse(&bytes).is_err());
    }
}
