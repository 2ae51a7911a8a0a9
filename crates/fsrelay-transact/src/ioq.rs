//! Operation queue
//!
//! Every in-flight operation lives in a slot of one table guarded by one
//! lock. The slot records which set the operation is in, so an operation
//! can never be in two sets at once:
//!
//! ```text
//!            enqueue               begin_processing          end_processing
//!  caller ──────────► Pending ──► Draining ──────────► Processing ──────► Dispatching
//!                        ▲   ▲       │  │                                   │    ▲
//!                 repost │   └ unget ┘  └ (not transmitted: cancelled)      │    │
//!                        └───────────┘                              retry   ▼    │ dequeue_retried
//!                                                                        Retried ┘
//! ```
//!
//! `Draining` and `Dispatching` are the moments the exchange holds an
//! operation outside any queue: after it is dequeued but before it is on the
//! wire, and while its completion handler runs. They count as Processing.
//!
//! Hints are `(generation << 32) | slot`. Releasing a slot bumps its
//! generation, so a stale or forged hint fails the lookup instead of
//! reaching whatever operation reuses the slot.

use crate::op::{OpState, Operation, Ticket};
use fsrelay_common::config::VolumeConfig;
use fsrelay_common::{Error, Hint, Result};
use fsrelay_proto::{Request, Response};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where an operation currently sits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Location {
    Pending,
    Draining,
    Processing,
    Dispatching,
    Retried,
}

impl Location {
    /// Counted against the queue capacity
    const fn is_active(self) -> bool {
        !matches!(self, Self::Retried)
    }

    const fn state(self) -> OpState {
        match self {
            Self::Pending => OpState::Pending,
            Self::Draining | Self::Processing | Self::Dispatching => OpState::Processing,
            Self::Retried => OpState::Retried,
        }
    }
}

struct Entry {
    op: Arc<Operation>,
    location: Location,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Result of [`Ioq::dequeue_for_transmission`]
#[derive(Debug)]
pub enum Dequeued {
    /// The oldest pending operation, now Draining
    Op(Arc<Operation>),
    /// Nothing eligible (empty, or the boundary is at the head)
    Empty,
    /// Waited the full timeout without a pending operation
    Timeout,
    /// The queue is stopped
    Stopped,
}

/// How long [`Ioq::submit`] lets an operation live
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitTimeout {
    /// Queue deadline of `operation_timeout`, enforced by `remove_expired`
    Default,
    /// No deadline; wait until completed or cancelled
    Infinite,
    /// No queue deadline; the caller gives up after this long and cancels
    Caller(Duration),
}

/// Queue statistics for monitoring
#[derive(Debug, Default)]
pub struct IoqStats {
    /// Operations accepted by enqueue
    pub enqueued: AtomicU64,
    /// Enqueues rejected as full
    pub rejected: AtomicU64,
    /// Operations completed with a result
    pub completed: AtomicU64,
    /// Operations cancelled (explicitly or by stop)
    pub cancelled: AtomicU64,
    /// Operations removed by deadline
    pub expired: AtomicU64,
    /// Replies whose hint matched nothing in Processing
    pub unmatched: AtomicU64,
}

#[derive(Default)]
struct State {
    slots: Vec<Slot>,
    free: Vec<u32>,
    pending: VecDeque<Hint>,
    retried: VecDeque<Hint>,
    active: usize,
    stopped: bool,
}

impl State {
    fn entry(&self, hint: Hint) -> Option<&Entry> {
        let slot = self.slots.get(hint.index() as usize)?;
        if slot.generation != hint.generation() {
            return None;
        }
        slot.entry.as_ref()
    }

    fn location(&self, hint: Hint) -> Option<Location> {
        self.entry(hint).map(|e| e.location)
    }

    /// Reserve a slot and return the hint it will carry
    fn reserve(&mut self) -> Option<Hint> {
        if let Some(index) = self.free.pop() {
            let generation = self.slots[index as usize].generation;
            return Some(Hint::from_parts(index, generation));
        }
        let index = u32::try_from(self.slots.len()).ok()?;
        self.slots.push(Slot {
            generation: 1,
            entry: None,
        });
        Some(Hint::from_parts(index, 1))
    }

    fn install(&mut self, hint: Hint, op: Arc<Operation>) {
        self.slots[hint.index() as usize].entry = Some(Entry {
            op,
            location: Location::Pending,
        });
        self.active += 1;
        self.pending.push_back(hint);
    }

    /// Move an entry to a new location, keeping the active count in step
    fn relocate(&mut self, hint: Hint, to: Location) -> Option<Arc<Operation>> {
        let slot = self.slots.get_mut(hint.index() as usize)?;
        if slot.generation != hint.generation() {
            return None;
        }
        let entry = slot.entry.as_mut()?;
        let from = entry.location;
        entry.location = to;
        entry.op.set_state(to.state());
        let op = Arc::clone(&entry.op);
        match (from.is_active(), to.is_active()) {
            (true, false) => self.active -= 1,
            (false, true) => self.active += 1,
            _ => {}
        }
        Some(op)
    }

    /// Remove an operation from whatever set holds it and free its slot
    fn release(&mut self, hint: Hint) -> Option<Arc<Operation>> {
        let slot = self.slots.get_mut(hint.index() as usize)?;
        if slot.generation != hint.generation() {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            g => g,
        };
        self.free.push(hint.index());

        match entry.location {
            Location::Pending => self.pending.retain(|h| *h != hint),
            Location::Retried => self.retried.retain(|h| *h != hint),
            _ => {}
        }
        if entry.location.is_active() {
            self.active -= 1;
        }
        Some(entry.op)
    }

    fn occupied(&self) -> impl Iterator<Item = (Hint, &Entry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let entry = slot.entry.as_ref()?;
            Some((Hint::from_parts(index as u32, slot.generation), entry))
        })
    }
}

/// Bounded multi-state operation queue for one volume
pub struct Ioq {
    state: Mutex<State>,
    /// Signalled when Pending gains an operation or the queue stops
    ready: Condvar,
    capacity: usize,
    best_effort_capacity: usize,
    operation_timeout: Duration,
    stats: IoqStats,
}

impl Ioq {
    #[must_use]
    pub fn new(capacity: usize, best_effort_capacity: usize, operation_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Condvar::new(),
            capacity,
            best_effort_capacity: best_effort_capacity.max(capacity),
            operation_timeout,
            stats: IoqStats::default(),
        }
    }

    #[must_use]
    pub fn from_config(config: &VolumeConfig) -> Self {
        Self::new(
            config.capacity,
            config.best_effort_capacity,
            config.operation_timeout(),
        )
    }

    #[must_use]
    pub const fn stats(&self) -> &IoqStats {
        &self.stats
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue an operation for transmission.
    ///
    /// Fails with `Full` once Pending + Processing reaches the capacity (the
    /// best-effort ceiling if `best_effort`), and with `Stopped` after
    /// [`Ioq::stop`].
    pub fn enqueue(&self, op: Operation, best_effort: bool) -> Result<Ticket> {
        let ceiling = if best_effort {
            self.best_effort_capacity
        } else {
            self.capacity
        };

        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        if state.active >= ceiling {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("enqueue rejected: {} active, ceiling {ceiling}", state.active);
            return Err(Error::Full);
        }
        let hint = state.reserve().ok_or(Error::Full)?;
        let (op, ticket) = op.arm(hint);
        state.install(hint, Arc::new(op));
        drop(state);

        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        Ok(ticket)
    }

    /// Enqueue a request and wait for its response
    pub fn submit(&self, request: Request, timeout: SubmitTimeout) -> Result<Response> {
        self.submit_op(Operation::new(request), timeout)
    }

    /// Enqueue a prepared operation and wait for its result
    pub fn submit_op(&self, op: Operation, timeout: SubmitTimeout) -> Result<Response> {
        let op = match timeout {
            SubmitTimeout::Default => op.with_deadline(Instant::now() + self.operation_timeout),
            SubmitTimeout::Infinite | SubmitTimeout::Caller(_) => op,
        };
        let ticket = self.enqueue(op, false)?;

        let SubmitTimeout::Caller(limit) = timeout else {
            return ticket.wait();
        };
        match ticket.wait_timeout(limit) {
            Err(Error::Timeout) => {
                if self.cancel(ticket.hint()) {
                    return Err(Error::Timeout);
                }
                // lost the race with a completion; its result is waiting
                ticket.try_result().unwrap_or(Err(Error::Timeout))
            }
            result => result,
        }
    }

    /// Take the oldest pending operation for transmission.
    ///
    /// Returns `Empty` when `boundary` is at the head of Pending. With
    /// `wait` set, blocks up to that long for an operation to arrive.
    pub fn dequeue_for_transmission(&self, boundary: Option<Hint>, wait: Option<Duration>) -> Dequeued {
        let deadline = wait.map(|w| Instant::now() + w);
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Dequeued::Stopped;
            }
            if let Some(&head) = state.pending.front() {
                if boundary == Some(head) {
                    return Dequeued::Empty;
                }
                state.pending.pop_front();
                return match state.relocate(head, Location::Draining) {
                    Some(op) => Dequeued::Op(op),
                    None => {
                        warn!("pending hint {head:?} had no slot; dropped");
                        continue;
                    }
                };
            }
            let Some(deadline) = deadline else {
                return Dequeued::Empty;
            };
            if self.ready.wait_until(&mut state, deadline).timed_out() && state.pending.is_empty() {
                return if state.stopped {
                    Dequeued::Stopped
                } else {
                    Dequeued::Timeout
                };
            }
        }
    }

    /// Put a drained operation back at the head of Pending (it did not fit)
    pub fn unget(&self, op: &Operation) -> bool {
        let mut state = self.state.lock();
        if state.location(op.hint()) != Some(Location::Draining) {
            return false;
        }
        state.relocate(op.hint(), Location::Pending);
        state.pending.push_front(op.hint());
        true
    }

    /// Put a drained operation at the tail of Pending to try again later.
    ///
    /// Not capacity checked. Fails once the queue is stopped.
    pub fn repost(&self, op: &Operation) -> bool {
        let mut state = self.state.lock();
        if state.stopped || state.location(op.hint()) != Some(Location::Draining) {
            return false;
        }
        state.relocate(op.hint(), Location::Pending);
        state.pending.push_back(op.hint());
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Mark a drained operation as on the wire.
    ///
    /// Returns `false` if the queue stopped or the operation was cancelled
    /// meanwhile; the caller must not transmit it.
    pub fn begin_processing(&self, op: &Operation) -> bool {
        let mut state = self.state.lock();
        if state.stopped || state.location(op.hint()) != Some(Location::Draining) {
            return false;
        }
        state.relocate(op.hint(), Location::Processing).is_some()
    }

    /// Claim the Processing operation a reply is addressed to.
    ///
    /// Returns it at most once per transmission; unknown, stale and
    /// duplicate hints fail with [`Error::InvalidCorrelation`].
    pub fn end_processing(&self, hint: Hint) -> Result<Arc<Operation>> {
        let mut state = self.state.lock();
        let op = if state.location(hint) == Some(Location::Processing) {
            state.relocate(hint, Location::Dispatching)
        } else {
            None
        };
        drop(state);
        op.ok_or_else(|| {
            self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
            Error::InvalidCorrelation(hint)
        })
    }

    /// Park an operation whose handler wants another pass
    pub fn retry(&self, op: &Operation) -> bool {
        let mut state = self.state.lock();
        if state.location(op.hint()) != Some(Location::Dispatching) {
            return false;
        }
        state.relocate(op.hint(), Location::Retried);
        state.retried.push_back(op.hint());
        true
    }

    /// Take the oldest retried operation unless `boundary` is at the head
    pub fn dequeue_retried(&self, boundary: Option<Hint>) -> Option<Arc<Operation>> {
        let mut state = self.state.lock();
        loop {
            let head = *state.retried.front()?;
            if boundary == Some(head) {
                return None;
            }
            state.retried.pop_front();
            if let Some(op) = state.relocate(head, Location::Dispatching) {
                return Some(op);
            }
        }
    }

    /// Finish an operation the exchange holds with its final result
    pub fn complete(&self, op: &Operation, result: Result<Response>) {
        self.state.lock().release(op.hint());
        self.finish(op, result);
    }

    /// Cancel one operation wherever it is
    pub fn cancel(&self, hint: Hint) -> bool {
        let Some(op) = self.state.lock().release(hint) else {
            return false;
        };
        debug!("cancelled operation {hint:?} ({:?})", op.kind());
        self.finish(&op, Err(Error::Cancelled))
    }

    /// Close the queue for good.
    ///
    /// With `cancel_all` every operation still held is completed with
    /// `Cancelled`; otherwise held operations are left to finish.
    pub fn stop(&self, cancel_all: bool) -> usize {
        let mut state = self.state.lock();
        let first = !state.stopped;
        state.stopped = true;
        let victims: Vec<_> = if cancel_all {
            let hints: Vec<_> = state.occupied().map(|(hint, _)| hint).collect();
            hints.into_iter().filter_map(|hint| state.release(hint)).collect()
        } else {
            Vec::new()
        };
        drop(state);
        self.ready.notify_all();

        if first || !victims.is_empty() {
            info!(
                "operation queue stopped (cancel_all={cancel_all}, cancelled {})",
                victims.len()
            );
        }
        for op in &victims {
            self.finish(op, Err(Error::Cancelled));
        }
        victims.len()
    }

    /// Time out every queued operation whose deadline is at or before `now`
    pub fn remove_expired(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<_> = state
            .occupied()
            .filter(|(_, entry)| {
                matches!(
                    entry.location,
                    Location::Pending | Location::Processing | Location::Retried
                ) && entry.op.deadline().is_some_and(|d| d <= now)
            })
            .map(|(hint, _)| hint)
            .collect();
        let expired: Vec<_> = expired
            .into_iter()
            .filter_map(|hint| state.release(hint))
            .collect();
        drop(state);

        for op in &expired {
            warn!("operation {:?} ({:?}) timed out", op.hint(), op.kind());
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            self.finish(op, Err(Error::Timeout));
        }
        expired.len()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[must_use]
    pub fn retried_count(&self) -> usize {
        self.state.lock().retried.len()
    }

    /// Operations between dequeue and their final dispatch
    #[must_use]
    pub fn processing_count(&self) -> usize {
        let state = self.state.lock();
        state.active - state.pending.len()
    }

    /// State of a queued operation, `None` once it has left the queue
    #[must_use]
    pub fn state_of(&self, hint: Hint) -> Option<OpState> {
        self.state.lock().location(hint).map(Location::state)
    }

    fn finish(&self, op: &Operation, result: Result<Response>) -> bool {
        let counter = match &result {
            Err(e) if e.is_cancellation() => &self.stats.cancelled,
            _ => &self.stats.completed,
        };
        let delivered = op.finish(result);
        if delivered {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }
}

impl Drop for Ioq {
    fn drop(&mut self) {
        self.stop(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsrelay_common::OpKind;
    use fsrelay_proto::{RequestBuilder, ResponseBuilder};
    use std::thread;

    fn ioq(capacity: usize) -> Ioq {
        Ioq::new(capacity, capacity * 2, Duration::from_secs(300))
    }

    fn op() -> Operation {
        Operation::new(RequestBuilder::new(OpKind::Read).build().unwrap())
    }

    fn drain_one(ioq: &Ioq) -> Arc<Operation> {
        match ioq.dequeue_for_transmission(None, None) {
            Dequeued::Op(op) => op,
            other => panic!("expected an operation, got {other:?}"),
        }
    }

    fn reply(op: &Operation) -> Response {
        ResponseBuilder::new(op.kind(), op.hint()).build().unwrap()
    }

    /// Every live operation appears in at most one set
    fn assert_disjoint(ioq: &Ioq) {
        let state = ioq.state.lock();
        let mut seen = std::collections::HashSet::new();
        for hint in state.pending.iter().chain(state.retried.iter()) {
            assert!(seen.insert(*hint), "{hint:?} queued twice");
        }
        for hint in &state.pending {
            assert_eq!(state.location(*hint), Some(Location::Pending));
        }
        for hint in &state.retried {
            assert_eq!(state.location(*hint), Some(Location::Retried));
        }
        let active = state.occupied().filter(|(_, e)| e.location.is_active()).count();
        assert_eq!(active, state.active);
    }

    #[test]
    fn test_fifo_order() {
        let ioq = ioq(10);
        let first = ioq.enqueue(op(), false).unwrap().hint();
        let second = ioq.enqueue(op(), false).unwrap().hint();
        assert_eq!(drain_one(&ioq).hint(), first);
        assert_eq!(drain_one(&ioq).hint(), second);
        assert!(matches!(ioq.dequeue_for_transmission(None, None), Dequeued::Empty));
    }

    #[test]
    fn test_capacity_enforcement() {
        let ioq = ioq(3);
        for _ in 0..3 {
            ioq.enqueue(op(), false).unwrap();
        }
        assert_eq!(ioq.enqueue(op(), false).unwrap_err(), Error::Full);

        // processing operations still count
        let drained = drain_one(&ioq);
        assert!(ioq.begin_processing(&drained));
        assert_eq!(ioq.enqueue(op(), false).unwrap_err(), Error::Full);

        // best effort admits up to the soft ceiling
        for _ in 0..3 {
            ioq.enqueue(op(), true).unwrap();
        }
        assert_eq!(ioq.enqueue(op(), true).unwrap_err(), Error::Full);
        assert_eq!(ioq.stats().rejected.load(Ordering::Relaxed), 3);
        assert_disjoint(&ioq);
    }

    #[test]
    fn test_end_processing_once() {
        let ioq = ioq(10);
        let ticket = ioq.enqueue(op(), false).unwrap();
        let drained = drain_one(&ioq);
        assert!(ioq.begin_processing(&drained));
        assert_eq!(ioq.state_of(ticket.hint()), Some(OpState::Processing));

        let claimed = ioq.end_processing(ticket.hint()).unwrap();
        assert!(ioq.end_processing(ticket.hint()).is_err());
        ioq.complete(&claimed, Ok(reply(&claimed)));
        assert!(ioq.end_processing(ticket.hint()).is_err());
        assert!(ticket.wait().is_ok());
        assert_eq!(ioq.state_of(ticket.hint()), None);
        assert_eq!(ioq.processing_count(), 0);
    }

    #[test]
    fn test_stale_generation_is_rejected() {
        let ioq = ioq(10);
        let old = ioq.enqueue(op(), false).unwrap().hint();
        assert!(ioq.cancel(old));

        // the slot is reused with a new generation
        let new = ioq.enqueue(op(), false).unwrap().hint();
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);

        let drained = drain_one(&ioq);
        assert!(ioq.begin_processing(&drained));
        assert!(matches!(
            ioq.end_processing(old),
            Err(Error::InvalidCorrelation(hint)) if hint == old
        ));
        assert!(matches!(
            ioq.end_processing(Hint::from(0xdead_u64)),
            Err(Error::InvalidCorrelation(_))
        ));
        assert!(ioq.end_processing(new).is_ok());
        assert_eq!(ioq.stats().unmatched.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_cancel_pending_and_processing() {
        let ioq = ioq(10);
        let pending = ioq.enqueue(op(), false).unwrap();
        let processing = ioq.enqueue(op(), false).unwrap();

        let first = drain_one(&ioq);
        assert_eq!(first.hint(), pending.hint());
        assert!(ioq.unget(&first));
        assert_eq!(ioq.pending_count(), 2);

        drain_one(&ioq);
        let second = drain_one(&ioq);
        assert!(ioq.begin_processing(&second));
        assert!(ioq.cancel(processing.hint()));
        assert_eq!(processing.wait(), Err(Error::Cancelled));
        assert!(ioq.end_processing(processing.hint()).is_err());
        assert!(!ioq.cancel(processing.hint()));
        assert_disjoint(&ioq);
    }

    #[test]
    fn test_cancel_while_draining_blocks_transmission() {
        let ioq = ioq(10);
        let ticket = ioq.enqueue(op(), false).unwrap();
        let drained = drain_one(&ioq);
        assert!(ioq.cancel(ticket.hint()));
        assert!(!ioq.begin_processing(&drained));
        assert_eq!(ticket.wait(), Err(Error::Cancelled));
    }

    #[test]
    fn test_retry_cycle() {
        let ioq = ioq(10);
        let ticket = ioq.enqueue(op(), false).unwrap();
        let drained = drain_one(&ioq);
        ioq.begin_processing(&drained);
        let claimed = ioq.end_processing(ticket.hint()).unwrap();

        assert!(ioq.retry(&claimed));
        assert!(!ioq.retry(&claimed));
        assert_eq!(ioq.state_of(ticket.hint()), Some(OpState::Retried));
        assert_eq!(ioq.retried_count(), 1);
        assert_eq!(ioq.processing_count(), 0);
        assert_disjoint(&ioq);

        assert!(ioq.dequeue_retried(Some(ticket.hint())).is_none());
        let again = ioq.dequeue_retried(None).unwrap();
        assert_eq!(again.hint(), ticket.hint());
        assert_eq!(ioq.state_of(ticket.hint()), Some(OpState::Processing));
        ioq.complete(&again, Err(Error::Remote(fsrelay_common::Status::ACCESS_DENIED)));
        assert!(ticket.wait().is_err());
    }

    #[test]
    fn test_boundary_stops_dequeue() {
        let ioq = ioq(10);
        let a = ioq.enqueue(op(), false).unwrap().hint();
        ioq.enqueue(op(), false).unwrap();

        let first = drain_one(&ioq);
        assert!(ioq.repost(&first));
        drain_one(&ioq);
        assert!(matches!(
            ioq.dequeue_for_transmission(Some(a), None),
            Dequeued::Empty
        ));
        assert_eq!(drain_one(&ioq).hint(), a);
    }

    #[test]
    fn test_dequeue_timeout() {
        let ioq = ioq(10);
        let start = Instant::now();
        assert!(matches!(
            ioq.dequeue_for_transmission(None, Some(Duration::from_millis(20))),
            Dequeued::Timeout
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_dequeue_wakes_on_enqueue() {
        let ioq = Arc::new(ioq(10));
        let waiter = {
            let ioq = Arc::clone(&ioq);
            thread::spawn(move || {
                matches!(
                    ioq.dequeue_for_transmission(None, Some(Duration::from_secs(5))),
                    Dequeued::Op(_)
                )
            })
        };
        thread::sleep(Duration::from_millis(20));
        ioq.enqueue(op(), false).unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_dequeue_wakes_on_stop() {
        let ioq = Arc::new(ioq(10));
        let waiter = {
            let ioq = Arc::clone(&ioq);
            thread::spawn(move || {
                matches!(
                    ioq.dequeue_for_transmission(None, Some(Duration::from_secs(5))),
                    Dequeued::Stopped
                )
            })
        };
        thread::sleep(Duration::from_millis(20));
        ioq.stop(false);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_remove_expired() {
        let ioq = ioq(10);
        let now = Instant::now();
        let ticket = ioq
            .enqueue(op().with_deadline(now + Duration::from_millis(10)), false)
            .unwrap();
        let untimed = ioq.enqueue(op(), false).unwrap();

        assert_eq!(ioq.remove_expired(now + Duration::from_millis(9)), 0);
        assert_eq!(ioq.remove_expired(now + Duration::from_millis(11)), 1);
        assert_eq!(ticket.wait(), Err(Error::Timeout));
        assert_eq!(ioq.state_of(untimed.hint()), Some(OpState::Pending));
        assert_eq!(ioq.pending_count(), 1);
        assert_disjoint(&ioq);
    }

    #[test]
    fn test_expire_processing() {
        let ioq = ioq(10);
        let now = Instant::now();
        let ticket = ioq
            .enqueue(op().with_deadline(now + Duration::from_millis(10)), false)
            .unwrap();
        let drained = drain_one(&ioq);
        ioq.begin_processing(&drained);
        assert_eq!(ioq.remove_expired(now + Duration::from_millis(11)), 1);
        assert!(ioq.end_processing(ticket.hint()).is_err());
        assert_eq!(ticket.wait(), Err(Error::Timeout));
    }

    #[test]
    fn test_expiry_skips_draining_but_hard_stop_cancels_it() {
        let ioq = ioq(10);
        let now = Instant::now();
        let ticket = ioq
            .enqueue(op().with_deadline(now + Duration::from_millis(10)), false)
            .unwrap();
        let drained = drain_one(&ioq);

        // held by the exchange between dequeue and begin_processing
        assert_eq!(ioq.remove_expired(now + Duration::from_millis(11)), 0);
        assert!(ticket.try_result().is_none());

        assert_eq!(ioq.stop(true), 1);
        assert_eq!(ticket.wait(), Err(Error::Cancelled));
        assert!(!ioq.begin_processing(&drained));
        assert_eq!(ioq.state_of(ticket.hint()), None);
    }

    #[test]
    fn test_stop_without_cancel_lets_processing_finish() {
        let ioq = ioq(10);
        let ticket = ioq.enqueue(op(), false).unwrap();
        let drained = drain_one(&ioq);
        assert!(ioq.begin_processing(&drained));

        assert_eq!(ioq.stop(false), 0);
        assert_eq!(ioq.state_of(ticket.hint()), Some(OpState::Processing));
        assert_eq!(ioq.enqueue(op(), false).unwrap_err(), Error::Stopped);

        let claimed = ioq.end_processing(ticket.hint()).unwrap();
        ioq.complete(&claimed, Ok(reply(&claimed)));
        assert!(ticket.wait().is_ok());
    }

    #[test]
    fn test_stop_cancel_all() {
        let ioq = ioq(10);
        let pending = ioq.enqueue(op(), false).unwrap();
        let processing = ioq.enqueue(op(), false).unwrap();
        drain_one(&ioq);
        let drained = drain_one(&ioq);
        ioq.begin_processing(&drained);

        assert_eq!(ioq.stop(true), 2);
        assert_eq!(pending.wait(), Err(Error::Cancelled));
        assert_eq!(processing.wait(), Err(Error::Cancelled));
        assert!(matches!(
            ioq.dequeue_for_transmission(None, None),
            Dequeued::Stopped
        ));
        assert_eq!(ioq.stats().cancelled.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_begin_processing_after_stop() {
        let ioq = ioq(10);
        let ticket = ioq.enqueue(op(), false).unwrap();
        let drained = drain_one(&ioq);
        ioq.stop(false);
        assert!(!ioq.begin_processing(&drained));
        assert!(!ioq.repost(&drained));
        ioq.complete(&drained, Err(Error::Cancelled));
        assert_eq!(ticket.wait(), Err(Error::Cancelled));
    }

    #[test]
    fn test_submit_caller_timeout_cancels() {
        let ioq = ioq(10);
        let request = RequestBuilder::new(OpKind::Read).build().unwrap();
        let result = ioq.submit(request, SubmitTimeout::Caller(Duration::from_millis(10)));
        assert_eq!(result, Err(Error::Timeout));
        assert_eq!(ioq.pending_count(), 0);
    }

    #[test]
    fn test_concurrent_enqueue_and_cancel_stay_disjoint() {
        let ioq = Arc::new(ioq(1000));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let ioq = Arc::clone(&ioq);
                thread::spawn(move || {
                    for i in 0..100 {
                        let ticket = ioq.enqueue(op(), false).unwrap();
                        if i % 2 == 0 {
                            ioq.cancel(ticket.hint());
                        }
                    }
                })
            })
            .collect();
        let drainer = {
            let ioq = Arc::clone(&ioq);
            thread::spawn(move || {
                for _ in 0..200 {
                    if let Dequeued::Op(op) = ioq.dequeue_for_transmission(None, None) {
                        if ioq.begin_processing(&op) {
                            if let Ok(op) = ioq.end_processing(op.hint()) {
                                ioq.complete(&op, Ok(reply(&op)));
                            }
                        }
                    }
                }
            })
        };
        for worker in workers {
            worker.join().unwrap();
        }
        drainer.join().unwrap();
        assert_disjoint(&ioq);
    }
}
