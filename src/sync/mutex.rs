// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};

/// `state` sentinel: nobody holds the lock.
const UNLOCKED: usize = 1;
/// `state` sentinel: the lock is held and no waiter has pushed itself yet.
/// Any other value is the address of the most recently pushed waiter.
const LOCKED: usize = 0;

/// A mutex for tasks: contended acquisition suspends the task instead of
/// blocking the thread.
///
/// Waiters push themselves onto a lock-free stack; `unlock` detaches that
/// stack, reverses it into a holder-private FIFO and hands the lock
/// directly to the FIFO head. Waiters that pushed between two unlocks are
/// therefore served in FIFO order, and every push eventually drains.
pub struct Mutex {
    state: AtomicUsize,
    /// Waiters already popped off the push stack, in wake order. Only the
    /// current holder touches this (during `unlock`), which is what makes
    /// the plain cell sound.
    fifo: UnsafeCell<*const Waiter>,
}

struct Waiter {
    waker: Waker,
    /// Set by the unlocker at handoff: when this flips, the popped waiter
    /// owns the lock.
    granted: AtomicBool,
    next: UnsafeCell<*const Waiter>,
}

// Safety: `state` is atomic, `fifo` is confined to the lock holder, and a
// `Waiter`'s `next` cell is only written before publication (push) or while
// the unlocker exclusively owns the detached stack.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}
unsafe impl Send for Waiter {}
unsafe impl Sync for Waiter {}

// === impl Mutex ===

impl Mutex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(UNLOCKED),
            fifo: UnsafeCell::new(ptr::null()),
        }
    }

    /// Attempt to acquire without suspending.
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Returns a future that resolves once the lock is held. The caller is
    /// responsible for the matching [`unlock`][Self::unlock]; prefer
    /// [`scoped_lock`][Self::scoped_lock].
    pub fn lock(&self) -> Lock<'_> {
        Lock {
            mutex: self,
            node: None,
        }
    }

    /// Returns a future resolving to a guard that releases the lock on
    /// every exit path.
    pub fn scoped_lock(&self) -> ScopedLock<'_> {
        ScopedLock { lock: self.lock() }
    }

    /// Release the lock, handing it to the longest-waiting task if any.
    ///
    /// Must only be called by the current holder.
    pub fn unlock(&self) {
        debug_assert_ne!(
            self.state.load(Ordering::Relaxed),
            UNLOCKED,
            "unlock of an unlocked Mutex"
        );
        // Safety: the holder has exclusive access to `fifo`, and stack nodes
        // detached below are exclusively ours until woken.
        unsafe {
            let fifo = self.fifo.get();
            if (*fifo).is_null() {
                if self
                    .state
                    .compare_exchange(LOCKED, UNLOCKED, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                // Waiters pushed since we acquired: detach the stack (the
                // mutex stays locked) and reverse LIFO into FIFO.
                let mut stack = self.state.swap(LOCKED, Ordering::Acquire) as *const Waiter;
                debug_assert!(!stack.is_null() && stack as usize != UNLOCKED);
                let mut head: *const Waiter = ptr::null();
                while !stack.is_null() {
                    let next = *(*stack).next.get();
                    *(*stack).next.get() = head;
                    head = stack;
                    stack = next;
                }
                *fifo = head;
            }

            let head = *fifo;
            debug_assert!(!head.is_null());
            *fifo = *(*head).next.get();

            // Ownership of the lock transfers to the popped waiter.
            let waiter = Arc::from_raw(head);
            waiter.granted.store(true, Ordering::Release);
            waiter.waker.wake_by_ref();
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        debug_assert_eq!(state, UNLOCKED, "Mutex dropped while locked");
        // Reclaim nodes abandoned by lock futures that were dropped while
        // queued, so nothing leaks even after a contract violation.
        unsafe {
            release_list(*self.fifo.get());
            if state != UNLOCKED && state != LOCKED {
                release_list(state as *const Waiter);
            }
        }
    }
}

/// # Safety
///
/// `head` must be the start of an exclusively owned waiter list whose nodes
/// were leaked with `Arc::into_raw`.
unsafe fn release_list(mut head: *const Waiter) {
    while !head.is_null() {
        // Safety: per the contract, we own the list
        unsafe {
            let next = *(*head).next.get();
            drop(Arc::from_raw(head));
            head = next;
        }
    }
}

/// Future returned by [`Mutex::lock`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Lock<'a> {
    mutex: &'a Mutex,
    node: Option<Arc<Waiter>>,
}

// === impl Lock ===

impl Future for Lock<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // Already queued: the unlocker hands the lock over by flipping
        // `granted`, so all we do is check for the handoff.
        if let Some(node) = this.node.take() {
            if node.granted.load(Ordering::Acquire) {
                return Poll::Ready(());
            }
            this.node = Some(node);
            return Poll::Pending;
        }

        if this.mutex.try_lock() {
            return Poll::Ready(());
        }

        let node = Arc::new(Waiter {
            waker: cx.waker().clone(),
            granted: AtomicBool::new(false),
            next: UnsafeCell::new(ptr::null()),
        });
        let raw = Arc::into_raw(Arc::clone(&node));

        let mut current = this.mutex.state.load(Ordering::Relaxed);
        loop {
            if current == UNLOCKED {
                match this.mutex.state.compare_exchange_weak(
                    UNLOCKED,
                    LOCKED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Acquired after all; the node was never published.
                        // Safety: `raw` came from `Arc::into_raw` above
                        unsafe { drop(Arc::from_raw(raw)) };
                        return Poll::Ready(());
                    }
                    Err(actual) => current = actual,
                }
            } else {
                let prev = if current == LOCKED {
                    ptr::null()
                } else {
                    current as *const Waiter
                };
                // Safety: the node is unpublished, we are its only writer
                unsafe { *(*raw).next.get() = prev };
                match this.mutex.state.compare_exchange_weak(
                    current,
                    raw as usize,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        this.node = Some(node);
                        return Poll::Pending;
                    }
                    Err(actual) => current = actual,
                }
            }
        }
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        // A queued future may be dropped after the unlocker already handed
        // us the lock; give it back so the mutex is not wedged.
        if let Some(node) = self.node.take() {
            if node.granted.load(Ordering::Acquire) {
                self.mutex.unlock();
            }
        }
    }
}

/// Future returned by [`Mutex::scoped_lock`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct ScopedLock<'a> {
    lock: Lock<'a>,
}

// === impl ScopedLock ===

impl<'a> Future for ScopedLock<'a> {
    type Output = MutexGuard<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.lock).poll(cx) {
            Poll::Ready(()) => Poll::Ready(MutexGuard {
                mutex: this.lock.mutex,
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Releases the lock when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

// === impl MutexGuard ===

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn try_lock_and_unlock() {
        let mutex = Mutex::new();
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn scoped_lock_is_exclusive() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default();

        let scheduler = Scheduler::new().unwrap();
        let mutex = Arc::new(Mutex::new());
        // deliberately incremented with a load/store pair so a broken mutex
        // loses updates
        let counter = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let scheduler2 = scheduler.clone();
            let mutex = mutex.clone();
            let counter = counter.clone();
            let finished = finished.clone();
            scheduler.spawn(async move {
                for _ in 0..5 {
                    let _guard = mutex.scoped_lock().await;
                    let seen = counter.load(Ordering::Relaxed);
                    scheduler2.sleep_for(Duration::from_millis(1)).await;
                    counter.store(seen + 1, Ordering::Relaxed);
                }
                if finished.fetch_add(1, Ordering::Relaxed) == 1 {
                    scheduler2.stop();
                }
            });
        }
        scheduler.run();

        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn waiters_are_woken_in_order() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default();

        let scheduler = Scheduler::new().unwrap();
        let mutex = Arc::new(Mutex::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in 0..3u32 {
            let scheduler2 = scheduler.clone();
            let mutex = mutex.clone();
            let order = order.clone();
            scheduler.spawn(async move {
                let _guard = mutex.scoped_lock().await;
                // hold across a suspension so the others queue up
                scheduler2.sleep_for(Duration::from_millis(2)).await;
                order.lock().unwrap().push(tag);
            });
        }
        scheduler.spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler.sleep_for(Duration::from_millis(50)).await;
                scheduler.stop();
            }
        });
        scheduler.run();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
