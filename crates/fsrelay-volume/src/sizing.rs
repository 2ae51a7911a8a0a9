//! Request sizing for remote directory listings

use crate::answer::DirInfoClass;
use fsrelay_common::config::{DirectoryConfig, VolumeConfig};
use fsrelay_proto::{DIR_ENTRY_HEADER_SIZE, DIR_TERMINATOR_SIZE, dir_entry_len};

/// How large a listing to ask the remote for.
///
/// Bounded below by one maximal-length entry plus terminator and above by
/// the configured request ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirSizing {
    min: usize,
    max: usize,
    average_name_bytes: usize,
}

/// Why a listing is being requested
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizingRule {
    /// The query names a single entry
    Lookup,
    /// Just enough entries to fill the caller's buffer
    Scaled,
    /// As many entries as the remote will return
    Full,
}

impl DirSizing {
    #[must_use]
    pub fn new(volume: &VolumeConfig, directory: &DirectoryConfig) -> Self {
        // names travel as UTF-8; one UTF-16 unit can need up to 4 bytes
        let min = dir_entry_len(volume.max_component_length * 4) + DIR_TERMINATOR_SIZE;
        Self {
            min,
            max: directory.max_request_size.max(min),
            average_name_bytes: directory.average_name_bytes.max(1),
        }
    }

    #[must_use]
    pub const fn min(&self) -> usize {
        self.min
    }

    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }

    /// Bytes to request for a caller buffer of `answer_len` in `class`
    #[must_use]
    pub fn request_size(&self, rule: SizingRule, answer_len: usize, class: DirInfoClass) -> usize {
        match rule {
            SizingRule::Lookup => self.min,
            SizingRule::Full => self.max,
            SizingRule::Scaled => {
                let wire = DIR_ENTRY_HEADER_SIZE + self.average_name_bytes;
                let answer = class.base_size() + self.average_name_bytes;
                (answer_len.saturating_mul(wire) / answer).clamp(self.min, self.max)
            }
        }
    }
}
