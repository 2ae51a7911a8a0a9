//! fsrelay Volume - a mounted volume and its metadata consumers
//!
//! A [`Volume`] owns the operation queue, the transact exchange and the
//! meta-cache set for one mount. File-system calls go through it:
//!
//! ```text
//!   query_directory / query_security / …
//!          │
//!          ▼
//!     meta-cache ──hit──▶ answer
//!          │miss
//!          ▼
//!     Ioq::submit ──▶ Exchange::transact ◀──▶ remote file system
//!          │
//!          ▼
//!     populate cache, answer
//! ```

pub mod answer;
pub mod dirctl;
pub mod metaquery;
pub mod node;
pub mod pattern;
pub mod sizing;
pub mod volume;

#[cfg(test)]
mod testkit;

pub use answer::{AnswerWriter, DirInfoClass, answer_names};
pub use dirctl::{DirHandle, DirQuery, Marker, QUERY_MARKER_NAME, QUERY_MARKER_OFFSET};
pub use node::Node;
pub use pattern::{Pattern, dir_order};
pub use sizing::{DirSizing, SizingRule};
pub use volume::{TickOutcome, Volume};
