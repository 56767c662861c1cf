// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

/// A slot holding the waker of at most one suspended task.
///
/// A wake that arrives while no waker is registered is latched in the
/// `woken` flag, so a waiter that checks a condition and then suspends
/// cannot lose a wakeup that slipped in between. This is what the channel
/// readiness slots and cancellation are built on.
pub(crate) struct WaitCell {
    inner: Mutex<Inner>,
}

struct Inner {
    waker: Option<Waker>,
    woken: bool,
}

// === impl WaitCell ===

impl WaitCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                waker: None,
                woken: false,
            }),
        }
    }

    /// Wake the registered waiter, or latch the wake for the next one.
    pub(crate) fn wake(&self) {
        let waker = {
            let mut inner = self.inner.lock().unwrap();
            inner.woken = true;
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// # Panics
    ///
    /// Panics when a second task tries to register while another task's
    /// waker is already stored; each slot supports a single waiter.
    pub(crate) fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.woken {
            inner.woken = false;
            inner.waker = None;
            return Poll::Ready(());
        }
        match &inner.waker {
            Some(existing) if !existing.will_wake(cx.waker()) => {
                panic!("more than one task suspended on a single waiter slot");
            }
            _ => inner.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }

    pub(crate) fn wait(&self) -> Wait<'_> {
        Wait { cell: self }
    }
}

/// Future returned by [`WaitCell::wait`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) struct Wait<'a> {
    cell: &'a WaitCell,
}

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.cell.poll_wait(cx)
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        // With at most one waiter, any stored waker is ours; clear it so a
        // future waiter of the slot does not trip over a stale registration
        // when this wait is abandoned mid-suspension.
        self.cell.inner.lock().unwrap().waker = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn wake_before_wait_is_latched() {
        let cell = WaitCell::new();
        cell.wake();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(cell.poll_wait(&mut cx).is_ready());
        // the latch is consumed
        assert!(cell.poll_wait(&mut cx).is_pending());
    }
}
