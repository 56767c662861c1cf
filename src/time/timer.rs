// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::task::Waker;
use std::time::Instant;

/// A one-shot timer owned by the scheduler's heap.
///
/// Entries order by `(when, seq)` so timers sharing a deadline fire in
/// submission order; `seq` comes from a process-wide counter.
pub(crate) struct TimerEntry {
    when: Instant,
    seq: u64,
    waker: Waker,
}

// === impl TimerEntry ===

impl TimerEntry {
    pub(crate) fn new(when: Instant, seq: u64, waker: Waker) -> Self {
        Self { when, seq, waker }
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.when.cmp(&other.when).then(self.seq.cmp(&other.seq))
    }
}

/// Min-heap of pending timers keyed by absolute deadline.
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
}

// === impl TimerHeap ===

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub(crate) fn push(&mut self, entry: TimerEntry) {
        self.heap.push(Reverse(entry));
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.0.when)
    }

    /// Pop every entry due at `now` and hand back its waker; earliest
    /// deadlines first.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<Waker> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|entry| entry.0.when <= now) {
            let Reverse(entry) = self.heap.pop().expect("peeked entry vanished");
            due.push(entry.waker);
        }
        due
    }
}
