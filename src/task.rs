// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::Shared;
use futures::task::{self, ArcWake};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::Context;

/// A fire-and-forget task: a boxed future plus the remote of the scheduler
/// that polls it.
///
/// Waking pushes the task back onto its scheduler's ready queue; the future
/// slot is cleared on completion so late wakes from leftover wakers become
/// no-ops. Polling only ever happens on the scheduler thread, but wakes may
/// arrive from anywhere, hence the mutex around the slot.
pub(crate) struct Task {
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    shared: Arc<Shared>,
}

// === impl Task ===

impl Task {
    pub(crate) fn spawn<F>(future: F, shared: Arc<Shared>)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(Task {
            future: Mutex::new(Some(Box::pin(future))),
            shared,
        });
        task.reschedule();
    }

    fn reschedule(self: &Arc<Self>) {
        let task = Arc::clone(self);
        self.shared.schedule(Box::new(move || task.run()));
    }

    fn run(self: Arc<Self>) {
        let mut slot = self.future.lock().unwrap();
        let Some(future) = slot.as_mut() else {
            // completed earlier, this was a stale wake
            return;
        };
        let waker = task::waker_ref(&self);
        let mut cx = Context::from_waker(&waker);
        if future.as_mut().poll(&mut cx).is_ready() {
            *slot = None;
        }
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.reschedule();
    }
}
