// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! The scheduler's timer heap: deadlines ordered earliest-first, used both for
//! `sleep_until`/`sleep_for` and as the timeout half of `await_fd`.
//!
//! Grounded on mioco's `Timer`/`TimerCore` (`timer.rs`), reworked from the teacher's
//! per-event-source `mio_orig::EventLoop::timeout_ms` registration (mio's pre-1.0 timer
//! wheel, since removed from the crate) into an explicit min-heap the scheduler consults to
//! compute its next poll wait, using `std::time::Instant` in place of the teacher's `time`
//! crate `SteadyTime`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// A registered timer's identity, returned by [`TimerHeap::insert`] so it can be cancelled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerId(u64);

struct Entry {
    deadline: Instant,
    id: TimerId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: `BinaryHeap` is a max-heap, we want the earliest deadline on top.
        other.deadline.cmp(&self.deadline)
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of pending deadlines, keyed by an opaque [`TimerId`] the caller associates
/// with whatever should happen when the deadline elapses (waking a coroutine, raising
/// timed-out on an `await_fd`).
#[derive(Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Entry>,
    next_id: u64,
    cancelled: std::collections::HashSet<TimerId>,
}

impl TimerHeap {
    pub fn new() -> Self {
        TimerHeap {
            heap: BinaryHeap::new(),
            next_id: 0,
            cancelled: std::collections::HashSet::new(),
        }
    }

    /// Register a new deadline, returning its id.
    pub fn insert(&mut self, deadline: Instant) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Entry { deadline, id });
        id
    }

    /// Convenience: register a deadline `delay` from now.
    pub fn insert_after(&mut self, delay: Duration) -> TimerId {
        self.insert(Instant::now() + delay)
    }

    /// Cancel a previously inserted timer; a no-op if it already fired or was cancelled.
    /// Lazily removed from the heap when it would otherwise be popped.
    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// Pop and return every timer id whose deadline is `<= now`, skipping cancelled ones.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let Entry { id, .. } = self.heap.pop().unwrap();
            if !self.cancelled.remove(&id) {
                fired.push(id);
            }
        }
        fired
    }

    /// Duration until the next non-cancelled deadline, or `None` if the heap is empty.
    /// Cancelled entries at the top are discarded as a side effect.
    pub fn next_wait(&mut self, now: Instant) -> Option<Duration> {
        loop {
            match self.heap.peek() {
                None => return None,
                Some(top) if self.cancelled.contains(&top.id) => {
                    self.heap.pop();
                    continue;
                }
                Some(top) => {
                    return Some(top.deadline.saturating_duration_since(now));
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let a = heap.insert(now + Duration::from_millis(30));
        let b = heap.insert(now + Duration::from_millis(10));
        let c = heap.insert(now + Duration::from_millis(20));

        let fired = heap.drain_expired(now + Duration::from_millis(25));
        assert_eq!(fired, vec![b, c]);
        assert!(!heap.is_empty());
        let rest = heap.drain_expired(now + Duration::from_millis(100));
        assert_eq!(rest, vec![a]);
        assert!(heap.is_empty());
    }

    #[test]
    fn cancel_suppresses_firing() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let a = heap.insert(now + Duration::from_millis(10));
        heap.cancel(a);
        let fired = heap.drain_expired(now + Duration::from_millis(20));
        assert!(fired.is_empty());
    }

    #[test]
    fn next_wait_reflects_earliest_pending() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        assert!(heap.next_wait(now).is_none());
        heap.insert(now + Duration::from_millis(50));
        let wait = heap.next_wait(now).unwrap();
        assert!(wait <= Duration::from_millis(50));
    }
}
