// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::Scheduler;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Unregistered,
    Registered,
    Completed,
}

/// Future returned by [`Scheduler::sleep_for`] and
/// [`Scheduler::sleep_until`].
///
/// Registers a one-shot timer on first poll; the heap entry owns a plain
/// waker, so dropping a `Sleep` early just leaves an entry that fires into
/// a dead waker at its deadline.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep<'a> {
    scheduler: &'a Scheduler,
    deadline: Instant,
    state: State,
}

// === impl Sleep ===

impl<'a> Sleep<'a> {
    pub(crate) fn new(scheduler: &'a Scheduler, deadline: Instant) -> Self {
        Self {
            scheduler,
            deadline,
            state: State::Unregistered,
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.state == State::Completed {
            return Poll::Ready(());
        }
        if Instant::now() >= this.deadline {
            this.state = State::Completed;
            return Poll::Ready(());
        }
        if this.state == State::Unregistered {
            this.scheduler.schedule_at(this.deadline, cx.waker().clone());
            this.state = State::Registered;
        }
        Poll::Pending
    }
}
