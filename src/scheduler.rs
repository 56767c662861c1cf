// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::io::{Interest, TriggerMode};
use crate::reactor::{IoHandler, Reactor, WAKEUP_TOKEN, WakeFd};
use crate::task::Task;
use crate::time::Sleep;
use crate::time::timer::{TimerEntry, TimerHeap};
use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Fallback epoll timeout when no timer is pending.
const DEFAULT_TIMEOUT_MS: i32 = 10_000;

thread_local! {
    static CURRENT: RefCell<Weak<Scheduler>> = RefCell::new(Weak::new());
}

/// Channel ids are a process-wide counter so an id is never reused even
/// across schedulers; 0 is reserved for the wakeup eventfd.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(WAKEUP_TOKEN + 1);

static TIMER_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) type Runnable = Box<dyn FnOnce() + Send>;

/// A single-threaded cooperative scheduler multiplexing tasks over an epoll
/// reactor, a timer heap and a cross-thread wakeup eventfd.
///
/// A scheduler is pinned to the thread that constructs it, which must also
/// be the thread that calls [`run`][Self::run]. Constructing a second
/// scheduler on the same thread panics. Handles are freely shareable:
/// [`stop`][Self::stop], [`schedule`][Self::schedule],
/// [`schedule_at`][Self::schedule_at] and [`spawn`][Self::spawn] are safe
/// from any thread and wake the event loop when called from a foreign one.
pub struct Scheduler {
    shared: Arc<Shared>,
    // Drain side of the ready and pending-timer queues plus the reactor and
    // the timer heap. Only the scheduler thread touches these; the mutexes
    // exist to keep the handle shareable and are never contended.
    ready_rx: Mutex<Receiver<Runnable>>,
    timer_rx: Mutex<Receiver<TimerEntry>>,
    timers: Mutex<TimerHeap>,
    reactor: Mutex<Reactor>,
}

/// The cross-thread face of a scheduler: the submit side of its queues, the
/// wakeup eventfd and the stop flag. Tasks hold onto this instead of the
/// full [`Scheduler`] so waking never touches loop-local state.
pub(crate) struct Shared {
    ready_tx: Sender<Runnable>,
    timer_tx: Sender<TimerEntry>,
    wakeup: WakeFd,
    running: AtomicBool,
    /// Callables submitted but not yet drained. Lets the loop skip blocking
    /// on epoll while same-thread work is already queued, e.g. tasks
    /// spawned before `run`. Incremented before the send so the drain side
    /// can never observe more items than the counter.
    pending: AtomicUsize,
    thread: ThreadId,
}

// === impl Shared ===

impl Shared {
    pub(crate) fn is_in_scheduler_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub(crate) fn schedule(&self, runnable: Runnable) {
        self.pending.fetch_add(1, Ordering::Release);
        if self.ready_tx.send(runnable).is_err() {
            // the scheduler is gone, drop the callable on the floor
            self.pending.fetch_sub(1, Ordering::Release);
            return;
        }
        if !self.is_in_scheduler_thread() {
            self.wakeup.notify();
        }
    }
}

// === impl Scheduler ===

impl Scheduler {
    /// Create a scheduler pinned to the calling thread.
    ///
    /// Suppresses `SIGPIPE` process-wide so writes to closed peers surface
    /// as `EPIPE` instead of killing the process.
    ///
    /// # Errors
    ///
    /// Fails when the epoll instance or the wakeup eventfd cannot be
    /// created.
    ///
    /// # Panics
    ///
    /// Panics if a scheduler already exists on this thread.
    pub fn new() -> io::Result<Arc<Self>> {
        CURRENT.with(|current| {
            assert!(
                current.borrow().upgrade().is_none(),
                "a Scheduler already exists on this thread"
            );
        });

        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let mut reactor = Reactor::new()?;
        let wakeup = WakeFd::new()?;
        reactor.register_wakeup(wakeup.as_raw_fd())?;

        let (ready_tx, ready_rx) = channel();
        let (timer_tx, timer_rx) = channel();

        let scheduler = Arc::new(Self {
            shared: Arc::new(Shared {
                ready_tx,
                timer_tx,
                wakeup,
                running: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
                thread: thread::current().id(),
            }),
            ready_rx: Mutex::new(ready_rx),
            timer_rx: Mutex::new(timer_rx),
            timers: Mutex::new(TimerHeap::new()),
            reactor: Mutex::new(reactor),
        });
        CURRENT.with(|current| *current.borrow_mut() = Arc::downgrade(&scheduler));

        Ok(scheduler)
    }

    /// Returns this thread's scheduler.
    ///
    /// # Panics
    ///
    /// Panics if no scheduler was constructed on the calling thread.
    #[must_use]
    pub fn current() -> Arc<Self> {
        Self::try_current().expect("no Scheduler on this thread")
    }

    #[must_use]
    pub fn try_current() -> Option<Arc<Self>> {
        CURRENT.with(|current| current.borrow().upgrade())
    }

    #[must_use]
    pub fn is_in_scheduler_thread(&self) -> bool {
        self.shared.is_in_scheduler_thread()
    }

    /// Run the event loop until [`stop`][Self::stop] is observed.
    ///
    /// Each iteration drains newly submitted timers, blocks on epoll for at
    /// most the time until the earliest deadline, dispatches I/O readiness
    /// to the registered channel handlers, expires due timers and finally
    /// drains the ready queue to empty. That fixed order is the ordering
    /// guarantee observable by tasks: I/O completions before same-iteration
    /// timers before ready-queue callables.
    pub fn run(&self) {
        assert!(
            self.is_in_scheduler_thread(),
            "Scheduler::run must be called from the thread that created it"
        );
        let _span = tracing::debug_span!("scheduler").entered();
        self.shared.running.store(true, Ordering::Release);

        while self.shared.running.load(Ordering::Acquire) {
            let timeout_ms = self.next_timeout();
            self.poll_io(timeout_ms);
            self.expire_timers();
            self.drain_ready();
        }
        tracing::debug!("event loop exited");
    }

    /// Request loop termination. Safe from any thread; pending tasks stay
    /// suspended and are dropped with the scheduler.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wakeup.notify();
    }

    /// Enqueue a callable to run on the scheduler thread. Safe from any
    /// thread; foreign callers wake the event loop.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.schedule(Box::new(f));
    }

    /// Enqueue a suspended task's waker for resumption on the scheduler
    /// thread.
    pub fn schedule_waker(&self, waker: Waker) {
        self.schedule(move || waker.wake());
    }

    /// Invoke `f` synchronously when already on the scheduler thread,
    /// otherwise behave like [`schedule`][Self::schedule].
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_scheduler_thread() {
            f();
        } else {
            self.schedule(f);
        }
    }

    /// Submit a one-shot timer waking `waker` at `when`. Safe from any
    /// thread.
    pub fn schedule_at(&self, when: Instant, waker: Waker) {
        let seq = TIMER_SEQ.fetch_add(1, Ordering::Relaxed);
        if self.shared.timer_tx.send(TimerEntry::new(when, seq, waker)).is_err() {
            return;
        }
        if !self.is_in_scheduler_thread() {
            self.shared.wakeup.notify();
        }
    }

    /// Returns a future that resumes once `duration` has elapsed.
    pub fn sleep_for(&self, duration: Duration) -> Sleep<'_> {
        self.sleep_until(Instant::now() + duration)
    }

    /// Returns a future that resumes at `when`.
    pub fn sleep_until(&self, when: Instant) -> Sleep<'_> {
        Sleep::new(self, when)
    }

    /// Returns a future that completes on the scheduler thread: immediately
    /// when already there, otherwise after a trip through the ready queue.
    ///
    /// The awaiting task must be owned by this scheduler; a task spawned on
    /// a different scheduler cannot migrate here and would be re-polled on
    /// its home thread forever.
    pub fn switch_to(&self) -> SwitchTo<'_> {
        SwitchTo { scheduler: self }
    }

    /// Start a fire-and-forget task.
    ///
    /// The future is polled only on the scheduler thread. A panic escaping
    /// it unwinds through [`run`][Self::run]; there is no one to observe a
    /// failure, so none is swallowed.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Task::spawn(future, Arc::clone(&self.shared));
    }

    pub(crate) fn next_channel_id() -> u64 {
        NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn set_io_handler(&self, id: u64, fd: RawFd, handler: Arc<IoHandler>) {
        debug_assert!(self.is_in_scheduler_thread());
        self.reactor.lock().unwrap().set_handler(id, fd, handler);
    }

    pub(crate) fn update_io(&self, id: u64, fd: RawFd, interest: Interest, mode: TriggerMode) {
        debug_assert!(self.is_in_scheduler_thread());
        self.reactor.lock().unwrap().update(id, fd, interest, mode);
    }

    pub(crate) fn remove_io(&self, id: u64) {
        debug_assert!(self.is_in_scheduler_thread());
        self.reactor.lock().unwrap().remove(id);
    }

    fn next_timeout(&self) -> i32 {
        let mut timers = self.timers.lock().unwrap();
        {
            let timer_rx = self.timer_rx.lock().unwrap();
            while let Ok(entry) = timer_rx.try_recv() {
                timers.push(entry);
            }
        }

        // ready callables take precedence over blocking in epoll
        if self.shared.pending.load(Ordering::Acquire) > 0 {
            return 0;
        }

        let Some(next) = timers.next_deadline() else {
            return DEFAULT_TIMEOUT_MS;
        };
        let now = Instant::now();
        if next <= now {
            return 0;
        }
        // round up so we do not wake a hair early and spin
        i32::try_from((next - now).as_millis() + 1).unwrap_or(i32::MAX)
    }

    fn poll_io(&self, timeout_ms: i32) {
        let events = self.reactor.lock().unwrap().wait(timeout_ms);
        for (id, ready) in events {
            if id == WAKEUP_TOKEN {
                self.shared.wakeup.drain();
                continue;
            }
            // The handler is cloned out of the registry before invocation so
            // it may re-enter the reactor (enable/disable/cancel).
            let handler = self.reactor.lock().unwrap().handler(id);
            match handler {
                Some((fd, handler)) => {
                    tracing::trace!(channel = id, fd, ?ready, "io event");
                    handler(fd, ready);
                }
                None => tracing::trace!(channel = id, "event for unregistered channel"),
            }
        }
    }

    fn expire_timers(&self) {
        let due = self.timers.lock().unwrap().expire(Instant::now());
        for waker in due {
            waker.wake();
        }
    }

    fn drain_ready(&self) {
        loop {
            let next = self.ready_rx.lock().unwrap().try_recv();
            match next {
                Ok(runnable) => {
                    self.shared.pending.fetch_sub(1, Ordering::Release);
                    runnable();
                }
                Err(_) => break,
            }
        }
    }
}

/// Future returned by [`Scheduler::switch_to`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct SwitchTo<'a> {
    scheduler: &'a Scheduler,
}

// === impl SwitchTo ===

impl Future for SwitchTo<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.scheduler.is_in_scheduler_thread() {
            Poll::Ready(())
        } else {
            self.scheduler.schedule_waker(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default()
    }

    #[test]
    fn spawn_and_stop() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        scheduler.spawn({
            let scheduler = scheduler.clone();
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::Relaxed);
                scheduler.stop();
            }
        });
        scheduler.run();

        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn ready_queue_is_fifo_within_an_iteration() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            scheduler.schedule(move || order.lock().unwrap().push(i));
        }
        {
            let scheduler2 = scheduler.clone();
            scheduler.schedule(move || scheduler2.stop());
        }
        scheduler.run();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn sleep_elapses() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let elapsed = Arc::new(Mutex::new(None));

        scheduler.spawn({
            let scheduler = scheduler.clone();
            let elapsed = elapsed.clone();
            async move {
                let begin = Instant::now();
                scheduler.sleep_for(Duration::from_millis(50)).await;
                *elapsed.lock().unwrap() = Some(begin.elapsed());
                scheduler.stop();
            }
        });
        scheduler.run();

        let elapsed = elapsed.lock().unwrap().expect("sleep never finished");
        assert!(
            elapsed >= Duration::from_millis(40),
            "expected to sleep at least 40ms, but got {elapsed:?}"
        );
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (tag, delay_ms) in [(1u32, 30u64), (2, 10)] {
            let scheduler2 = scheduler.clone();
            let order = order.clone();
            scheduler.spawn(async move {
                scheduler2.sleep_for(Duration::from_millis(delay_ms)).await;
                order.lock().unwrap().push(tag);
            });
        }
        scheduler.spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler.sleep_for(Duration::from_millis(80)).await;
                scheduler.stop();
            }
        });
        scheduler.run();

        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn switch_to_is_immediate_on_own_thread() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        scheduler.spawn({
            let scheduler = scheduler.clone();
            let done = done.clone();
            async move {
                scheduler.switch_to().await;
                done.fetch_add(1, Ordering::Relaxed);
                scheduler.stop();
            }
        });
        scheduler.run();

        assert_eq!(done.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn foreign_thread_schedule_wakes_the_loop() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let remote = scheduler.clone();
        let remote_hits = hits.clone();
        let submitter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let scheduler = remote.clone();
            remote.schedule(move || {
                remote_hits.fetch_add(1, Ordering::Relaxed);
                scheduler.stop();
            });
        });

        scheduler.run();
        submitter.join().unwrap();

        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dispatch_runs_inline_on_own_thread() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let hit = Arc::new(AtomicUsize::new(0));

        let hit2 = hit.clone();
        scheduler.dispatch(move || {
            hit2.fetch_add(1, Ordering::Relaxed);
        });

        // ran synchronously, without the loop
        assert_eq!(hit.load(Ordering::Relaxed), 1);
    }
}
