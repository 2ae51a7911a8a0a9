//! Caller-facing directory answer formats
//!
//! Entries are written in the layout of the matching NT information class:
//! UTF-16LE names, 8-byte aligned entries, each entry's first field holding
//! the distance to the next one (zero on the last).

use fsrelay_proto::{DirEntry, align_up};

/// Directory information class requested by the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DirInfoClass {
    /// Names only
    Names,
    /// Times, sizes and attributes
    Directory,
    /// `Directory` plus EA size
    FullDirectory,
    /// `FullDirectory` plus file id
    IdFullDirectory,
}

impl DirInfoClass {
    /// Fixed bytes per entry before the name
    #[must_use]
    pub const fn base_size(self) -> usize {
        match self {
            Self::Names => 12,
            Self::Directory => 64,
            Self::FullDirectory => 68,
            Self::IdFullDirectory => 80,
        }
    }

    /// Bytes an entry for `name` occupies (unaligned)
    #[must_use]
    pub fn entry_size(self, name: &str) -> usize {
        self.base_size() + name.encode_utf16().count() * 2
    }
}

/// Fills a caller buffer with entries of one class
#[derive(Debug)]
pub struct AnswerWriter<'a> {
    buf: &'a mut [u8],
    class: DirInfoClass,
    len: usize,
    last: Option<usize>,
    entries: usize,
}

impl<'a> AnswerWriter<'a> {
    #[must_use]
    pub const fn new(buf: &'a mut [u8], class: DirInfoClass) -> Self {
        Self {
            buf,
            class,
            len: 0,
            last: None,
            entries: 0,
        }
    }

    #[must_use]
    pub const fn class(&self) -> DirInfoClass {
        self.class
    }

    /// Bytes written, excluding padding after the last entry
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries == 0
    }

    #[must_use]
    pub const fn entries(&self) -> usize {
        self.entries
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Append an entry; returns `false` if it does not fit
    pub fn push(&mut self, entry: &DirEntry<'_>) -> bool {
        let start = if self.last.is_some() {
            align_up(self.len)
        } else {
            0
        };
        let size = self.class.entry_size(entry.name);
        if start + size > self.buf.len() {
            return false;
        }
        let Ok(name_len) = u32::try_from(size - self.class.base_size()) else {
            return false;
        };

        self.buf[self.len..start].fill(0);
        let out = &mut self.buf[start..start + size];
        out.fill(0);
        let info = &entry.info;
        // next_entry_offset is patched when a following entry lands
        put_u32(out, 4, u32::try_from(info.index_number).unwrap_or(0));
        let name_at = match self.class {
            DirInfoClass::Names => {
                put_u32(out, 8, name_len);
                12
            }
            DirInfoClass::Directory | DirInfoClass::FullDirectory | DirInfoClass::IdFullDirectory => {
                put_u64(out, 8, info.creation_time);
                put_u64(out, 16, info.last_access_time);
                put_u64(out, 24, info.last_write_time);
                put_u64(out, 32, info.change_time);
                put_u64(out, 40, info.file_size);
                put_u64(out, 48, info.allocation_size);
                put_u32(out, 56, info.file_attributes);
                put_u32(out, 60, name_len);
                match self.class {
                    DirInfoClass::FullDirectory => {
                        put_u32(out, 64, info.ea_size);
                        68
                    }
                    DirInfoClass::IdFullDirectory => {
                        put_u32(out, 64, info.ea_size);
                        put_u64(out, 72, info.index_number);
                        80
                    }
                    _ => 64,
                }
            }
        };
        for (i, unit) in entry.name.encode_utf16().enumerate() {
            out[name_at + i * 2..name_at + i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }

        if let Some(last) = self.last {
            let distance = u32::try_from(start - last).unwrap_or(0);
            put_u32(&mut self.buf[last..], 0, distance);
        }
        self.last = Some(start);
        self.len = start + size;
        self.entries += 1;
        true
    }
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Decode the names in an answer buffer (used by tests and tools)
#[must_use]
pub fn answer_names(buf: &[u8], class: DirInfoClass) -> Vec<String> {
    let (len_at, name_at) = match class {
        DirInfoClass::Names => (8, 12),
        other => (60, other.base_size()),
    };
    let mut names = Vec::new();
    let mut pos = 0;
    while pos + class.base_size() <= buf.len() {
        let entry = &buf[pos..];
        let read = |at: usize| u32::from_le_bytes([entry[at], entry[at + 1], entry[at + 2], entry[at + 3]]);
        let next = read(0) as usize;
        let name_len = read(len_at) as usize;
        let Some(raw) = entry.get(name_at..name_at + name_len) else {
            break;
        };
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        names.push(String::from_utf16_lossy(&units));
        if next == 0 {
            break;
        }
        pos += next;
    }
    names
}
