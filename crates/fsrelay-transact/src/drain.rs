//! Forward-progress bound for drain loops
//!
//! A drain loop takes items from a queue that its own body may refill (an
//! operation reposted to Pending, a handler retrying itself). The loop stops
//! when either the count observed at entry is used up or the first item
//! the loop put back comes around again.

use fsrelay_common::Hint;

/// Outcome of one drain step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Item handled; keep draining
    Continue,
    /// Item went back onto the queue being drained
    Requeued(Hint),
    /// Stop draining now
    Stop,
}

/// Bounds one drain loop by the queue length at entry plus a boundary hint
#[derive(Clone, Copy, Debug)]
pub struct BoundedDrain {
    remaining: usize,
    boundary: Option<Hint>,
}

impl BoundedDrain {
    #[must_use]
    pub const fn new(count_at_entry: usize) -> Self {
        Self {
            remaining: count_at_entry,
            boundary: None,
        }
    }

    /// First item requeued by this loop, if any
    #[must_use]
    pub const fn boundary(&self) -> Option<Hint> {
        self.boundary
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.remaining
    }

    /// Record a requeued item; only the first one becomes the boundary
    pub fn mark(&mut self, hint: Hint) {
        if self.boundary.is_none() {
            self.boundary = Some(hint);
        }
    }

    /// Drain until the budget is spent, `next` runs dry or `step` says stop.
    ///
    /// `next` receives the current boundary and must return `None` once the
    /// boundary item is at the head of its queue. Returns the number of items
    /// taken.
    pub fn run<T>(
        &mut self,
        mut next: impl FnMut(Option<Hint>) -> Option<T>,
        mut step: impl FnMut(T) -> Step,
    ) -> usize {
        let mut taken = 0;
        while self.remaining > 0 {
            let Some(item) = next(self.boundary) else {
                break;
            };
            self.remaining -= 1;
            taken += 1;
            match step(item) {
                Step::Continue => {}
                Step::Requeued(hint) => self.mark(hint),
                Step::Stop => break,
            }
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn queue(n: u32) -> VecDeque<Hint> {
        (1..=n).map(|i| Hint::from_parts(i, 1)).collect()
    }

    fn pop(queue: &mut VecDeque<Hint>, boundary: Option<Hint>) -> Option<Hint> {
        if queue.front().copied() == boundary && boundary.is_some() {
            return None;
        }
        queue.pop_front()
    }

    #[test]
    fn test_budget_limits_drain() {
        let mut q = queue(10);
        let mut drain = BoundedDrain::new(4);
        let taken = drain.run(|b| pop(&mut q, b), |_| Step::Continue);
        assert_eq!(taken, 4);
        assert_eq!(q.len(), 6);
    }

    #[test]
    fn test_requeue_everything_terminates() {
        let q = std::cell::RefCell::new(queue(5));
        let mut drain = BoundedDrain::new(usize::MAX);
        let taken = drain.run(
            |b| pop(&mut q.borrow_mut(), b),
            |hint| {
                q.borrow_mut().push_back(hint);
                Step::Requeued(hint)
            },
        );
        assert_eq!(taken, 5);
        assert_eq!(q.borrow().len(), 5);
        assert_eq!(drain.boundary(), Some(Hint::from_parts(1, 1)));
    }

    #[test]
    fn test_stop_step_ends_drain() {
        let mut q = queue(3);
        let mut drain = BoundedDrain::new(3);
        let taken = drain.run(|b| pop(&mut q, b), |_| Step::Stop);
        assert_eq!(taken, 1);
        assert_eq!(drain.remaining(), 2);
    }

    #[test]
    fn test_only_first_requeue_is_boundary() {
        let mut drain = BoundedDrain::new(2);
        drain.mark(Hint::from_parts(1, 1));
        drain.mark(Hint::from_parts(2, 1));
        assert_eq!(drain.boundary(), Some(Hint::from_parts(1, 1)));
    }
}
