//! fsrelay Protocol - transact wire records
//!
//! Requests and responses travel packed back-to-back in flat byte buffers
//! that the remote side may have written. Every record is self-describing:
//!
//! ```text
//! ┌──────────────────────────────┬─────────────────────────────┐
//! │ fixed header                 │ trailing region             │
//! │ size │ kind │ hint │ fields… │ name, pattern, payload…     │
//! └──────────────────────────────┴─────────────────────────────┘
//!            fields hold {offset, size} extents ──────┘
//! ```
//!
//! Records start on 8-byte boundaries. Variable-length fields are never
//! addressed by pointer, only by [`Extent`], and every extent is resolved
//! through [`Extent::resolve`] so nothing reads outside its record.

pub mod dirinfo;
pub mod frame;
pub mod layout;
pub mod request;
pub mod response;

pub use dirinfo::{
    DIR_ENTRY_HEADER_SIZE, DIR_TERMINATOR_SIZE, DirEntries, DirEntry, DirListingWriter, FileInfo,
    dir_entry_len,
};
pub use frame::{RecordReader, RecordWriter};
pub use layout::{ALIGNMENT, Extent, align_up};
pub use request::{REQUEST_HEADER_SIZE, Request, RequestBuilder};
pub use response::{RESPONSE_HEADER_SIZE, Response, ResponseBuilder};
