// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::scheduler::Scheduler;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

struct State<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    ready: bool,
    outcome: Option<Result<T, Error>>,
    waiters: Vec<Waker>,
}

/// The producing half of a one-shot future/promise pair.
///
/// The outcome is set exactly once, with [`set_value`][Self::set_value] or
/// [`set_exception`][Self::set_exception]; every task suspended on the
/// paired future is then resumed through the promise's scheduler, or inline
/// when the promise is unbound. Producer and consumers may live on
/// different threads; the shared state's mutex is the synchronization
/// point.
pub struct Promise<T = ()> {
    state: Arc<State<T>>,
    scheduler: Option<Arc<Scheduler>>,
}

// === impl Promise ===

impl<T> Promise<T> {
    /// Create a promise bound to the calling thread's scheduler, or unbound
    /// if the thread has none.
    #[must_use]
    pub fn new() -> Self {
        Self::bound(Scheduler::try_current())
    }

    /// Create a promise that resumes its waiters on `scheduler`.
    #[must_use]
    pub fn with_scheduler(scheduler: Arc<Scheduler>) -> Self {
        Self::bound(Some(scheduler))
    }

    fn bound(scheduler: Option<Arc<Scheduler>>) -> Self {
        Self {
            state: Arc::new(State {
                inner: Mutex::new(Inner {
                    ready: false,
                    outcome: None,
                    waiters: Vec::new(),
                }),
            }),
            scheduler,
        }
    }

    #[must_use]
    pub fn get_future(&self) -> Future<T> {
        Future {
            state: Some(self.state.clone()),
        }
    }

    /// # Panics
    ///
    /// Panics when the promise was already completed.
    pub fn set_value(&self, value: T) {
        self.complete(Ok(value));
    }

    /// # Panics
    ///
    /// Panics when the promise was already completed.
    pub fn set_exception(&self, error: Error) {
        self.complete(Err(error));
    }

    fn complete(&self, outcome: Result<T, Error>) {
        let waiters = {
            let mut inner = self.state.inner.lock().unwrap();
            assert!(!inner.ready, "promise completed twice");
            inner.outcome = Some(outcome);
            inner.ready = true;
            std::mem::take(&mut inner.waiters)
        };
        match &self.scheduler {
            Some(scheduler) => {
                for waker in waiters {
                    scheduler.schedule_waker(waker);
                }
            }
            None => {
                for waker in waiters {
                    waker.wake();
                }
            }
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The single-consumer half of a promise pair.
///
/// Awaiting yields `Result<T, Error>` and invalidates the future (the
/// state pointer is released); use [`share`][Self::share] for multiple
/// consumers.
pub struct Future<T = ()> {
    state: Option<Arc<State<T>>>,
}

// === impl Future ===

impl<T> Future<T> {
    /// `false` once the future was consumed by awaiting or
    /// [`share`][Self::share].
    #[must_use]
    pub fn valid(&self) -> bool {
        self.state.is_some()
    }

    /// Convert into a multi-consumer, re-awaitable future.
    #[must_use]
    pub fn share(mut self) -> SharedFuture<T> {
        SharedFuture {
            state: self.state.take().expect("future has no shared state"),
        }
    }
}

impl<T> core::future::Future for Future<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let state = this
            .state
            .clone()
            .expect("future polled after completion");
        let mut inner = state.inner.lock().unwrap();
        if inner.ready {
            let outcome = inner.outcome.take().expect("future outcome already taken");
            drop(inner);
            this.state = None;
            Poll::Ready(outcome)
        } else {
            push_waiter(&mut inner.waiters, cx.waker());
            Poll::Pending
        }
    }
}

/// A multi-consumer view of a promise's outcome.
///
/// Clones share the same state; each clone may be awaited (consuming the
/// clone, not the state) and every consumer observes an identical outcome,
/// which requires `T: Clone`.
pub struct SharedFuture<T = ()> {
    state: Arc<State<T>>,
}

// === impl SharedFuture ===

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone> core::future::Future for SharedFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.state.inner.lock().unwrap();
        if inner.ready {
            let outcome = inner
                .outcome
                .as_ref()
                .expect("shared state marked ready without an outcome");
            Poll::Ready(outcome.clone())
        } else {
            push_waiter(&mut inner.waiters, cx.waker());
            Poll::Pending
        }
    }
}

fn push_waiter(waiters: &mut Vec<Waker>, waker: &Waker) {
    if !waiters.iter().any(|existing| existing.will_wake(waker)) {
        waiters.push(waker.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default()
    }

    #[test]
    fn value_reaches_the_awaiting_future() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let promise = Promise::<i32>::new();
        let future = promise.get_future();
        assert!(future.valid());
        let received = Arc::new(AtomicUsize::new(0));

        scheduler.spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler.sleep_for(Duration::from_millis(10)).await;
                promise.set_value(99);
            }
        });
        scheduler.spawn({
            let scheduler = scheduler.clone();
            let received = received.clone();
            async move {
                let value = future.await.unwrap();
                received.store(value as usize, Ordering::Relaxed);
                scheduler.stop();
            }
        });
        scheduler.run();

        assert_eq!(received.load(Ordering::Relaxed), 99);
    }

    #[test]
    fn exception_is_observed_not_a_value() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let promise = Promise::<i32>::new();
        let future = promise.get_future();
        let saw_error = Arc::new(AtomicUsize::new(0));

        scheduler.spawn(async move {
            promise.set_exception(Error::Disconnected);
        });
        scheduler.spawn({
            let scheduler = scheduler.clone();
            let saw_error = saw_error.clone();
            async move {
                match future.await {
                    Err(Error::Disconnected) => {
                        saw_error.store(1, Ordering::Relaxed);
                    }
                    other => panic!("expected Disconnected, got {other:?}"),
                }
                scheduler.stop();
            }
        });
        scheduler.run();

        assert_eq!(saw_error.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn shared_future_fans_out_to_all_waiters() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let promise = Promise::<i32>::with_scheduler(scheduler.clone());
        let shared = promise.get_future().share();
        let accumulator = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let scheduler2 = scheduler.clone();
            let shared = shared.clone();
            let accumulator = accumulator.clone();
            let finished = finished.clone();
            scheduler.spawn(async move {
                let value = shared.await.unwrap();
                accumulator.fetch_add(value as usize, Ordering::Relaxed);
                if finished.fetch_add(1, Ordering::Relaxed) == 1 {
                    scheduler2.stop();
                }
            });
        }

        // fulfil from a foreign thread, through the wakeup eventfd
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            promise.set_value(10);
        });

        scheduler.run();
        setter.join().unwrap();

        assert_eq!(accumulator.load(Ordering::Relaxed), 20);
    }

    #[test]
    #[should_panic(expected = "promise completed twice")]
    fn double_completion_panics() {
        let promise = Promise::<i32>::bound(None);
        promise.set_value(1);
        promise.set_value(2);
    }
}
