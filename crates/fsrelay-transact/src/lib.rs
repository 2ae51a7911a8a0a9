//! fsrelay Transact - operation queue and wire exchange
//!
//! ```text
//!   caller ──submit──► Pending ──drain──► Processing ──reply──► handler
//!                         ▲                                       │
//!                         └──── repost          Retried ◄── retry ┘
//! ```
//!
//! [`Ioq`] holds every in-flight [`Operation`] in exactly one set.
//! [`Exchange`] runs one round trip with the remote: it consumes a buffer of
//! responses and fills a buffer with new requests. Both of its drain loops
//! are bounded by [`BoundedDrain`].

pub mod drain;
pub mod exchange;
pub mod ioq;
pub mod op;

pub use drain::{BoundedDrain, Step};
pub use exchange::{Exchange, ExchangeOutcome, ExchangeStats, Mode};
pub use ioq::{Dequeued, Ioq, IoqStats, SubmitTimeout};
pub use op::{CompletionHandler, Disposition, OpState, Operation, Passthrough, Prepare, Ticket};
