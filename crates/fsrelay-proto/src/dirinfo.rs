//! Packed directory-entry records
//!
//! A directory listing is a sequence of 8-aligned entries. A complete
//! listing ends with a terminator (an entry whose size field is zero); a
//! listing cut short by the requested size has no terminator.
//!
//! # Entry layout
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 4    | size             |
//! | 4      | 4    | file_attributes  |
//! | 8      | 4    | reparse_tag      |
//! | 12     | 4    | hard_links       |
//! | 16     | 8    | allocation_size  |
//! | 24     | 8    | file_size        |
//! | 32     | 8    | creation_time    |
//! | 40     | 8    | last_access_time |
//! | 48     | 8    | last_write_time  |
//! | 56     | 8    | change_time      |
//! | 64     | 8    | index_number     |
//! | 72     | 4    | ea_size          |
//! | 76     | 4    | reserved         |
//! | 80     | 8    | next_offset      |
//! | 88     | -    | name (UTF-8)     |

use crate::layout::align_up;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fsrelay_common::{Error, Result};

/// Fixed size of a directory entry before its name
pub const DIR_ENTRY_HEADER_SIZE: usize = 88;

/// Space taken by the listing terminator
pub const DIR_TERMINATOR_SIZE: usize = 8;

/// Attributes and times reported for a file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub file_attributes: u32,
    pub reparse_tag: u32,
    pub hard_links: u32,
    pub allocation_size: u64,
    pub file_size: u64,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub change_time: u64,
    pub index_number: u64,
    pub ea_size: u32,
}

impl FileInfo {
    pub const ATTRIBUTE_DIRECTORY: u32 = 0x10;
    pub const ATTRIBUTE_ARCHIVE: u32 = 0x20;

    #[must_use]
    pub const fn is_directory(&self) -> bool {
        self.file_attributes & Self::ATTRIBUTE_DIRECTORY != 0
    }
}

/// Encoded length of an entry with a `name_len`-byte name
#[must_use]
pub const fn dir_entry_len(name_len: usize) -> usize {
    align_up(DIR_ENTRY_HEADER_SIZE + name_len)
}

/// One decoded entry, borrowing its name from the listing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirEntry<'a> {
    /// Byte offset of this entry within the listing
    pub offset: usize,
    pub info: FileInfo,
    /// Opaque resume token for the entry after this one
    pub next_offset: u64,
    pub name: &'a str,
}

/// Iterator over a packed listing.
///
/// Stops at the terminator or at the end of the buffer; a corrupt entry
/// yields one error and ends the walk.
#[derive(Clone, Debug)]
pub struct DirEntries<'a> {
    buf: &'a [u8],
    pos: usize,
    complete: bool,
    done: bool,
}

impl<'a> DirEntries<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self::starting_at(buf, 0)
    }

    /// Resume a walk at a byte offset returned by an earlier entry
    #[must_use]
    pub const fn starting_at(buf: &'a [u8], pos: usize) -> Self {
        Self {
            buf,
            pos,
            complete: false,
            done: false,
        }
    }

    /// Whether the walk reached the terminator
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// Offset the next call to `next` reads from
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    fn fail(&mut self, msg: String) -> Option<Result<DirEntry<'a>>> {
        self.done = true;
        Some(Err(Error::malformed(msg)))
    }
}

impl<'a> Iterator for DirEntries<'a> {
    type Item = Result<DirEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let Some(rest) = self.buf.get(self.pos..) else {
            return self.fail(format!("entry offset {} beyond listing", self.pos));
        };
        if rest.len() < 4 {
            self.done = true;
            return None;
        }

        let mut src = rest;
        let size = src.get_u32_le() as usize;
        if size == 0 {
            self.done = true;
            self.complete = true;
            return None;
        }
        if size < DIR_ENTRY_HEADER_SIZE || size > rest.len() {
            return self.fail(format!("entry at {} has invalid size {size}", self.pos));
        }

        let info = FileInfo {
            file_attributes: src.get_u32_le(),
            reparse_tag: src.get_u32_le(),
            hard_links: src.get_u32_le(),
            allocation_size: src.get_u64_le(),
            file_size: src.get_u64_le(),
            creation_time: src.get_u64_le(),
            last_access_time: src.get_u64_le(),
            last_write_time: src.get_u64_le(),
            change_time: src.get_u64_le(),
            index_number: src.get_u64_le(),
            ea_size: src.get_u32_le(),
        };
        src.advance(4);
        let next_offset = src.get_u64_le();

        let Ok(name) = std::str::from_utf8(&rest[DIR_ENTRY_HEADER_SIZE..size]) else {
            return self.fail(format!("entry at {} has a non UTF-8 name", self.pos));
        };

        let entry = DirEntry {
            offset: self.pos,
            info,
            next_offset,
            name,
        };
        self.pos = (self.pos + align_up(size)).min(self.buf.len());
        Some(Ok(entry))
    }
}

/// Builds a listing no larger than a requested size
#[derive(Debug)]
pub struct DirListingWriter {
    buf: BytesMut,
    limit: usize,
}

impl DirListingWriter {
    /// Start a listing of at most `limit` bytes
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Bytes written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append an entry; returns `false` if it would not fit
    pub fn push(&mut self, info: &FileInfo, next_offset: u64, name: &str) -> bool {
        let len = dir_entry_len(name.len());
        if self.buf.len() + len > self.limit {
            return false;
        }
        let Ok(size) = u32::try_from(DIR_ENTRY_HEADER_SIZE + name.len()) else {
            return false;
        };
        let start = self.buf.len();
        self.buf.put_u32_le(size);
        self.buf.put_u32_le(info.file_attributes);
        self.buf.put_u32_le(info.reparse_tag);
        self.buf.put_u32_le(info.hard_links);
        self.buf.put_u64_le(info.allocation_size);
        self.buf.put_u64_le(info.file_size);
        self.buf.put_u64_le(info.creation_time);
        self.buf.put_u64_le(info.last_access_time);
        self.buf.put_u64_le(info.last_write_time);
        self.buf.put_u64_le(info.change_time);
        self.buf.put_u64_le(info.index_number);
        self.buf.put_u32_le(info.ea_size);
        self.buf.put_u32_le(0);
        self.buf.put_u64_le(next_offset);
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.resize(start + len, 0);
        true
    }

    /// Finish a listing that ran out of room
    #[must_use]
    pub fn finish_partial(self) -> Bytes {
        self.buf.freeze()
    }

    /// Finish a listing that holds every remaining entry.
    ///
    /// Falls back to a partial listing if the terminator does not fit.
    #[must_use]
    pub fn finish_complete(mut self) -> Bytes {
        if self.buf.len() + DIR_TERMINATOR_SIZE <= self.limit {
            self.buf.put_u64_le(0);
        }
        self.buf.freeze()
    }
}
