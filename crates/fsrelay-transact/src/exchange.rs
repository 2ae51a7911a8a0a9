//! Transact exchange: one request/response round trip with the remote
//!
//! 1. Consume the responses in `inbound` and hand each to the handler of
//!    the operation its hint names. Unknown hints and malformed records are
//!    dropped.
//! 2. Re-dispatch retried operations, bounded by the Retried count at entry.
//! 3. With no outbound space, stop.
//! 4. Wait up to the transact timeout for a pending operation.
//! 5. Fill `outbound` with requests, bounded by the Pending count at entry.
//!
//! Steps 2 and 5 both drain through [`BoundedDrain`], so a handler that
//! keeps retrying or a request that keeps reposting cannot keep the loop
//! spinning.

use crate::drain::{BoundedDrain, Step};
use crate::ioq::{Dequeued, Ioq};
use crate::op::{CompletionHandler, Disposition, Operation, Passthrough, Prepare};
use fsrelay_common::{Error, Result};
use fsrelay_proto::{RESPONSE_HEADER_SIZE, RecordReader, RecordWriter, Response, align_up};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How many requests one round trip may produce
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    /// At most one request
    Single,
    /// As many requests as fit
    #[default]
    Batch,
}

/// What one round trip did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeOutcome {
    /// Bytes written to the outbound buffer
    pub bytes_produced: usize,
    /// Requests written to the outbound buffer
    pub requests: usize,
    /// Responses handed to a completion handler
    pub dispatched: usize,
}

/// Exchange statistics for monitoring
#[derive(Debug, Default)]
pub struct ExchangeStats {
    /// Round trips started
    pub round_trips: AtomicU64,
    /// Responses dispatched (first delivery or retry)
    pub dispatched: AtomicU64,
    /// Responses dropped because no Processing operation matched
    pub unmatched: AtomicU64,
    /// Records dropped as malformed
    pub malformed: AtomicU64,
    /// Requests transmitted
    pub requests: AtomicU64,
    /// Requests sent back to Pending by their handler
    pub reposts: AtomicU64,
    /// Round trips that found no pending work before the timeout
    pub idle: AtomicU64,
}

/// Runs transact round trips against one queue
pub struct Exchange {
    ioq: Arc<Ioq>,
    transact_timeout: Duration,
    default_handler: Arc<dyn CompletionHandler>,
    stats: ExchangeStats,
}

impl Exchange {
    #[must_use]
    pub fn new(ioq: Arc<Ioq>, transact_timeout: Duration) -> Self {
        Self {
            ioq,
            transact_timeout,
            default_handler: Arc::new(Passthrough),
            stats: ExchangeStats::default(),
        }
    }

    /// Handler for operations enqueued without one
    #[must_use]
    pub fn with_default_handler(mut self, handler: Arc<dyn CompletionHandler>) -> Self {
        self.default_handler = handler;
        self
    }

    #[must_use]
    pub const fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    #[must_use]
    pub const fn ioq(&self) -> &Arc<Ioq> {
        &self.ioq
    }

    /// Run one round trip.
    ///
    /// An empty `outbound` only delivers responses. Fails with `Stopped` if
    /// the queue is stopped while waiting for work, and with
    /// `BufferTooSmall` if `outbound` cannot hold even the first request.
    pub fn transact(&self, inbound: &[u8], outbound: &mut [u8], mode: Mode) -> Result<ExchangeOutcome> {
        self.stats.round_trips.fetch_add(1, Ordering::Relaxed);
        let mut outcome = ExchangeOutcome {
            dispatched: self.consume_responses(inbound),
            ..ExchangeOutcome::default()
        };
        outcome.dispatched += self.consume_retried();

        if outbound.is_empty() {
            return Ok(outcome);
        }

        let first = match self
            .ioq
            .dequeue_for_transmission(None, Some(self.transact_timeout))
        {
            Dequeued::Op(op) => op,
            Dequeued::Empty | Dequeued::Timeout => {
                self.stats.idle.fetch_add(1, Ordering::Relaxed);
                return Ok(outcome);
            }
            Dequeued::Stopped => return Err(Error::Stopped),
        };

        let available = outbound.len();
        let mut writer = RecordWriter::new(outbound);
        let mut overflow = None;
        let mut produced = 0;
        let mut first = Some(first);
        let mut drain = BoundedDrain::new(1 + self.ioq.pending_count());
        drain.run(
            |boundary| {
                first.take().or_else(|| {
                    match self.ioq.dequeue_for_transmission(boundary, None) {
                        Dequeued::Op(op) => Some(op),
                        _ => None,
                    }
                })
            },
            |op| {
                let step = self.produce(&op, &mut writer, &mut overflow);
                if step == Step::Continue && writer.len() > produced {
                    produced = writer.len();
                    outcome.requests += 1;
                    if mode == Mode::Single {
                        return Step::Stop;
                    }
                }
                step
            },
        );

        if writer.is_empty()
            && let Some(required) = overflow
        {
            return Err(Error::BufferTooSmall {
                required,
                available,
            });
        }
        outcome.bytes_produced = writer.len();
        Ok(outcome)
    }

    fn consume_responses(&self, inbound: &[u8]) -> usize {
        let mut dispatched = 0;
        for record in RecordReader::new(inbound, RESPONSE_HEADER_SIZE) {
            let Ok(record) = record else {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                break;
            };
            let response = match Response::parse(record) {
                Ok(response) => response,
                Err(e) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!("skipping response record: {e}");
                    continue;
                }
            };
            let op = match self.ioq.end_processing(response.hint()) {
                Ok(op) => op,
                Err(e) => {
                    self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
                    debug!("dropping response: {e}");
                    continue;
                }
            };
            if response.kind() != op.kind() {
                warn!(
                    "response kind {:?} does not match operation {:?} ({:?})",
                    response.kind(),
                    op.hint(),
                    op.kind()
                );
                self.ioq.complete(
                    &op,
                    Err(Error::malformed("response kind does not match request")),
                );
                continue;
            }
            op.set_response(response);
            self.dispatch(&op);
            dispatched += 1;
        }
        dispatched
    }

    fn consume_retried(&self) -> usize {
        let mut drain = BoundedDrain::new(self.ioq.retried_count());
        drain.run(
            |boundary| self.ioq.dequeue_retried(boundary),
            |op| {
                if self.dispatch(&op) {
                    Step::Requeued(op.hint())
                } else {
                    Step::Continue
                }
            },
        )
    }

    /// Run the completion handler; returns `true` if the operation retried
    fn dispatch(&self, op: &Operation) -> bool {
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        let Some(response) = op.response() else {
            self.ioq
                .complete(op, Err(Error::malformed("dispatched without a response")));
            return false;
        };
        match self.handler_for(op).complete(op, &response) {
            Disposition::Complete(result) => {
                self.ioq.complete(op, result);
                false
            }
            Disposition::Retry => {
                trace!("operation {:?} retried", op.hint());
                self.ioq.retry(op)
            }
        }
    }

    fn produce(&self, op: &Operation, writer: &mut RecordWriter<'_>, overflow: &mut Option<usize>) -> Step {
        match self.handler_for(op).prepare(op) {
            Prepare::Transmit => {}
            Prepare::Repost => {
                self.stats.reposts.fetch_add(1, Ordering::Relaxed);
                if self.ioq.repost(op) {
                    return Step::Requeued(op.hint());
                }
                self.ioq.complete(op, Err(Error::Cancelled));
                return Step::Continue;
            }
            Prepare::Fail(e) => {
                self.ioq.complete(op, Err(e));
                return Step::Continue;
            }
        }

        let record = op.request().as_bytes();
        if !writer.fits(record.len()) {
            self.ioq.unget(op);
            *overflow = Some(align_up(record.len()));
            return Step::Stop;
        }
        if !self.ioq.begin_processing(op) {
            // stopped or cancelled since it was dequeued
            self.ioq.complete(op, Err(Error::Cancelled));
            return Step::Continue;
        }
        if let Err(e) = writer.push(record) {
            warn!("request {:?} did not fit after check: {e}", op.hint());
            self.ioq.cancel(op.hint());
            return Step::Stop;
        }
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        trace!("transmitted {:?} ({:?}, {} bytes)", op.hint(), op.kind(), record.len());
        Step::Continue
    }

    fn handler_for<'a>(&'a self, op: &'a Operation) -> &'a Arc<dyn CompletionHandler> {
        op.handler().unwrap_or(&self.default_handler)
    }
}
