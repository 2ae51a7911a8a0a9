//! Core type definitions for fsrelay
//!
//! Identifiers that cross component boundaries (correlation hints, cache
//! item indices, owner keys), the operation kinds carried on the wire and
//! the status codes a remote answers with.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation id linking a request record to its response record.
///
/// Packs a queue slot index (low 32 bits) and the slot's generation (high
/// 32 bits). A slot is reused only after its generation moves on, so a
/// replayed or forged hint never names a different live operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, From, Into)]
pub struct Hint(u64);

impl Hint {
    /// Hint carried by records that were never assigned to an operation
    pub const NONE: Self = Self(0);

    /// Build a hint from a slot index and generation
    #[must_use]
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    /// Slot index encoded in this hint
    #[must_use]
    pub const fn index(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// Slot generation encoded in this hint
    #[must_use]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hint({}:{})", self.index(), self.generation())
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle of an item in a meta-cache. Zero is never assigned.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct ItemIndex(u64);

impl ItemIndex {
    /// The "no item" index
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The index assigned after this one; skips zero on wrap-around
    #[must_use]
    pub const fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            n => Self(n),
        }
    }
}

/// Identifies the entity that owns cached metadata (a file or directory node)
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("node:{_0}")]
pub struct OwnerKey(u64);

impl OwnerKey {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Kind of metadata kept in a meta-cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaKind {
    /// Security descriptors
    Security,
    /// Whole-directory listings
    DirInfo,
    /// Named-stream listings
    StreamInfo,
    /// Extended attribute lists
    Ea,
}

impl MetaKind {
    /// Every kind, in a stable order
    pub const ALL: [Self; 4] = [Self::Security, Self::DirInfo, Self::StreamInfo, Self::Ea];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::DirInfo => "dir_info",
            Self::StreamInfo => "stream_info",
            Self::Ea => "ea",
        }
    }
}

impl fmt::Display for MetaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation opcode carried in every request and response header
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum OpKind {
    Reserved = 0,
    Create = 1,
    Overwrite = 2,
    Cleanup = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    QueryInformation = 7,
    SetInformation = 8,
    QueryEa = 9,
    SetEa = 10,
    FlushBuffers = 11,
    QueryVolumeInformation = 12,
    SetVolumeInformation = 13,
    QueryDirectory = 14,
    FileSystemControl = 15,
    DeviceControl = 16,
    Shutdown = 17,
    LockControl = 18,
    QuerySecurity = 19,
    SetSecurity = 20,
    QueryStreamInformation = 21,
}

impl OpKind {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for OpKind {
    type Error = crate::Error;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Reserved,
            1 => Self::Create,
            2 => Self::Overwrite,
            3 => Self::Cleanup,
            4 => Self::Close,
            5 => Self::Read,
            6 => Self::Write,
            7 => Self::QueryInformation,
            8 => Self::SetInformation,
            9 => Self::QueryEa,
            10 => Self::SetEa,
            11 => Self::FlushBuffers,
            12 => Self::QueryVolumeInformation,
            13 => Self::SetVolumeInformation,
            14 => Self::QueryDirectory,
            15 => Self::FileSystemControl,
            16 => Self::DeviceControl,
            17 => Self::Shutdown,
            18 => Self::LockControl,
            19 => Self::QuerySecurity,
            20 => Self::SetSecurity,
            21 => Self::QueryStreamInformation,
            other => return Err(crate::Error::malformed(format!("unknown operation kind {other}"))),
        })
    }
}

/// NT status code returned by the remote (or synthesized on forced completion)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, From, Into)]
pub struct Status(u32);

impl Status {
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const PENDING: Self = Self(0x0000_0103);
    pub const BUFFER_OVERFLOW: Self = Self(0x8000_0005);
    pub const NO_MORE_FILES: Self = Self(0x8000_0006);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);
    pub const NO_SUCH_FILE: Self = Self(0xC000_000F);
    pub const INVALID_DEVICE_REQUEST: Self = Self(0xC000_0010);
    pub const ACCESS_DENIED: Self = Self(0xC000_0022);
    pub const BUFFER_TOO_SMALL: Self = Self(0xC000_0023);
    pub const OBJECT_NAME_NOT_FOUND: Self = Self(0xC000_0034);
    pub const INSUFFICIENT_RESOURCES: Self = Self(0xC000_009A);
    pub const IO_TIMEOUT: Self = Self(0xC000_00B5);
    pub const NOT_A_DIRECTORY: Self = Self(0xC000_0103);
    pub const CANCELLED: Self = Self(0xC000_0120);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Success and informational codes (severity bits clear)
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >> 30 == 0
    }

    /// Error codes (both severity bits set)
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.0 >> 30 == 3
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({:#010x})", self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_parts() {
        let hint = Hint::from_parts(17, 3);
        assert_eq!(hint.index(), 17);
        assert_eq!(hint.generation(), 3);
        assert!(!hint.is_none());
        assert!(Hint::NONE.is_none());
        assert_ne!(Hint::from_parts(17, 4), hint);
    }

    #[test]
    fn test_item_index_wraps_past_zero() {
        assert_eq!(ItemIndex::new(1).next(), ItemIndex::new(2));
        assert_eq!(ItemIndex::new(u64::MAX).next(), ItemIndex::new(1));
        assert!(ItemIndex::NONE.is_none());
    }

    #[test]
    fn test_op_kind_round_trip() {
        for raw in 0..=21u32 {
            let kind = OpKind::try_from(raw).unwrap();
            assert_eq!(kind.as_u32(), raw);
        }
        assert!(OpKind::try_from(22).is_err());
    }

    #[test]
    fn test_status_severity() {
        assert!(Status::SUCCESS.is_success());
        assert!(Status::PENDING.is_success());
        assert!(!Status::NO_MORE_FILES.is_success());
        assert!(!Status::NO_MORE_FILES.is_error());
        assert!(Status::CANCELLED.is_error());
    }
}
