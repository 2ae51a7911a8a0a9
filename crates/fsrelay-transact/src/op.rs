//! Operations and their completion plumbing

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use fsrelay_common::{Error, Hint, OpKind, Result};
use fsrelay_proto::{Request, Response};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Lifecycle state of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpState {
    /// Created but not yet queued
    New = 0,
    Pending = 1,
    Processing = 2,
    Retried = 3,
    Completed = 4,
    Cancelled = 5,
}

impl From<u8> for OpState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Pending,
            2 => Self::Processing,
            3 => Self::Retried,
            4 => Self::Completed,
            5 => Self::Cancelled,
            _ => Self::New,
        }
    }
}

/// What the exchange should do with an operation it is about to transmit
#[derive(Debug)]
pub enum Prepare {
    /// Serialize the request onto the wire
    Transmit,
    /// Not ready yet; put it back at the tail of Pending
    Repost,
    /// Complete the operation with this error instead of transmitting
    Fail(Error),
}

/// What the exchange should do after a handler has seen a response
#[derive(Debug)]
pub enum Disposition {
    /// Finish the operation with this result
    Complete(Result<Response>),
    /// Keep the response and run the handler again on the next round trip
    Retry,
}

/// Per-operation hooks run by the exchange, outside the queue lock
pub trait CompletionHandler: Send + Sync {
    /// Called just before the request would be serialized
    fn prepare(&self, _op: &Operation) -> Prepare {
        Prepare::Transmit
    }

    /// Called with the matching response (again, after each retry)
    fn complete(&self, op: &Operation, response: &Response) -> Disposition;
}

/// Hands the response to the waiting caller unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl CompletionHandler for Passthrough {
    fn complete(&self, _op: &Operation, response: &Response) -> Disposition {
        Disposition::Complete(Ok(response.clone()))
    }
}

/// One caller-visible call awaiting a remote answer
pub struct Operation {
    hint: Hint,
    request: Request,
    deadline: Option<Instant>,
    handler: Option<Arc<dyn CompletionHandler>>,
    state: AtomicU8,
    response: Mutex<Option<Response>>,
    waiter: Mutex<Option<Sender<Result<Response>>>>,
}

impl Operation {
    #[must_use]
    pub fn new(request: Request) -> Self {
        Self {
            hint: Hint::NONE,
            request,
            deadline: None,
            handler: None,
            state: AtomicU8::new(OpState::New as u8),
            response: Mutex::new(None),
            waiter: Mutex::new(None),
        }
    }

    /// Absolute time after which the queue may time the operation out
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn CompletionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Correlation id; assigned when the operation is enqueued
    #[must_use]
    pub const fn hint(&self) -> Hint {
        self.hint
    }

    #[must_use]
    pub const fn kind(&self) -> OpKind {
        self.request.kind()
    }

    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.request
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn handler(&self) -> Option<&Arc<dyn CompletionHandler>> {
        self.handler.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> OpState {
        OpState::from(self.state.load(Ordering::Acquire))
    }

    /// Last response delivered for this operation
    #[must_use]
    pub fn response(&self) -> Option<Response> {
        self.response.lock().clone()
    }

    pub(crate) fn set_response(&self, response: Response) {
        *self.response.lock() = Some(response);
    }

    pub(crate) fn set_state(&self, state: OpState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Assign the hint and attach the completion channel
    pub(crate) fn arm(mut self, hint: Hint) -> (Self, Ticket) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.request = self.request.with_hint(hint);
        self.hint = hint;
        self.state = AtomicU8::new(OpState::Pending as u8);
        self.waiter = Mutex::new(Some(tx));
        (self, Ticket { hint, rx })
    }

    /// Deliver the final result. Only the first call has any effect.
    pub(crate) fn finish(&self, result: Result<Response>) -> bool {
        let Some(tx) = self.waiter.lock().take() else {
            return false;
        };
        let state = match &result {
            Err(e) if e.is_cancellation() => OpState::Cancelled,
            _ => OpState::Completed,
        };
        self.set_state(state);
        // the caller may have stopped waiting; nothing to do then
        let _ = tx.send(result);
        true
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("hint", &self.hint)
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Caller's side of an enqueued operation
#[derive(Debug)]
pub struct Ticket {
    hint: Hint,
    rx: Receiver<Result<Response>>,
}

impl Ticket {
    #[must_use]
    pub const fn hint(&self) -> Hint {
        self.hint
    }

    /// Block until the operation finishes
    pub fn wait(&self) -> Result<Response> {
        self.rx.recv().unwrap_or(Err(Error::Cancelled))
    }

    /// Block up to `timeout`; `Err(Timeout)` leaves the operation queued
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Response> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Cancelled),
        }
    }

    /// Result if the operation has already finished
    #[must_use]
    pub fn try_result(&self) -> Option<Result<Response>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsrelay_proto::{RequestBuilder, ResponseBuilder};

    fn op() -> Operation {
        Operation::new(RequestBuilder::new(OpKind::Read).build().unwrap())
    }

    #[test]
    fn test_arm_stamps_hint() {
        let hint = Hint::from_parts(4, 2);
        let (op, ticket) = op().arm(hint);
        assert_eq!(op.hint(), hint);
        assert_eq!(op.request().hint(), hint);
        assert_eq!(ticket.hint(), hint);
        assert_eq!(op.state(), OpState::Pending);
    }

    #[test]
    fn test_finish_once() {
        let hint = Hint::from_parts(1, 1);
        let (op, ticket) = op().arm(hint);
        assert!(ticket.try_result().is_none());

        let response = ResponseBuilder::new(OpKind::Read, hint).build().unwrap();
        assert!(op.finish(Ok(response.clone())));
        assert!(!op.finish(Err(Error::Cancelled)));
        assert_eq!(op.state(), OpState::Completed);
        assert_eq!(ticket.wait().unwrap(), response);
    }

    #[test]
    fn test_cancelled_state() {
        let (op, ticket) = op().arm(Hint::from_parts(1, 1));
        op.finish(Err(Error::Stopped));
        assert_eq!(op.state(), OpState::Cancelled);
        assert_eq!(ticket.wait_timeout(Duration::from_millis(1)), Err(Error::Stopped));
    }

    #[test]
    fn test_wait_timeout_without_result() {
        let (_op, ticket) = op().arm(Hint::from_parts(1, 1));
        assert_eq!(ticket.wait_timeout(Duration::from_millis(5)), Err(Error::Timeout));
    }

    #[test]
    fn test_dropped_operation_reads_as_cancelled() {
        let (op, ticket) = op().arm(Hint::from_parts(1, 1));
        drop(op);
        assert_eq!(ticket.wait(), Err(Error::Cancelled));
    }
}
