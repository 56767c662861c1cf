// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::reactor::IoHandler;
use crate::scheduler::Scheduler;
use crate::sync::wait_cell::WaitCell;
use std::any::Any;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

bitflags::bitflags! {
    /// Readiness a channel registers interest in. Bit values match epoll's.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        const READABLE = libc::EPOLLIN as u32;
        const WRITABLE = libc::EPOLLOUT as u32;
    }
}

bitflags::bitflags! {
    /// Readiness reported by epoll, including the conditions that are
    /// always delivered regardless of interest.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ready: u32 {
        const READABLE = libc::EPOLLIN as u32;
        const WRITABLE = libc::EPOLLOUT as u32;
        const ERROR = libc::EPOLLERR as u32;
        const HANGUP = libc::EPOLLHUP as u32;
        const READ_HANGUP = libc::EPOLLRDHUP as u32;
    }
}

/// Epoll trigger semantics, selected per channel.
///
/// Edge-triggered reports each readiness transition once and is the default
/// for connected sockets; level-triggered re-reports while the condition
/// holds and is what listen sockets use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    EdgeTriggered,
    LevelTriggered,
}

/// Verdict returned by a user I/O callable, driving the readiness machine
/// of [`IoChannel::perform_read`] / [`IoChannel::perform_write`].
#[derive(Debug)]
pub enum IoStatus {
    /// The operation finished.
    Success,
    /// The fd would block; suspend until it is readable again.
    NeedRead,
    /// The fd would block; suspend until it is writable again.
    NeedWrite,
    /// Transient condition (`EINTR`, partial progress): run the callable
    /// again immediately.
    Retry,
    /// Clean end of stream.
    Eof,
    /// Peer reset or broken pipe.
    Disconnect,
    /// Any other failure.
    Error(io::Error),
}

/// Successful completion of a `perform_*` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoComplete {
    Done,
    Eof,
}

/// Readiness record co-owned by the channel and the reactor's handler
/// closure (which only keeps a weak reference, so a dropped channel ignores
/// any event still in flight).
///
/// The readiness booleans are always stored before the waiter slot is
/// woken; at most one task is ever suspended per slot.
struct IoState {
    fd: RawFd,
    readable: AtomicBool,
    writable: AtomicBool,
    read_waiter: WaitCell,
    write_waiter: WaitCell,
    read_canceled: AtomicBool,
    write_canceled: AtomicBool,
}

// === impl IoState ===

impl IoState {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            readable: AtomicBool::new(false),
            // sockets start out writable; the first write discovers the
            // true state
            writable: AtomicBool::new(true),
            read_waiter: WaitCell::new(),
            write_waiter: WaitCell::new(),
            read_canceled: AtomicBool::new(false),
            write_canceled: AtomicBool::new(false),
        }
    }

    fn handle_events(&self, ready: Ready) {
        if ready.intersects(Ready::READABLE | Ready::ERROR | Ready::HANGUP | Ready::READ_HANGUP) {
            self.readable.store(true, Ordering::Release);
            self.read_waiter.wake();
        }
        if ready.intersects(Ready::WRITABLE | Ready::ERROR | Ready::HANGUP) {
            self.writable.store(true, Ordering::Release);
            self.write_waiter.wake();
        }
    }
}

/// Adapts a non-blocking fd to suspendable read/write operations.
///
/// The channel registers itself with its scheduler on construction and
/// deregisters on drop; both transitions are deferred onto the scheduler
/// thread, so channels may be created and dropped anywhere. The epoll user
/// data is the channel id, never the fd — fds are reused by the kernel, ids
/// never are.
///
/// At most one reader and one writer may be suspended on a channel at a
/// time; violating that panics.
pub struct IoChannel {
    id: u64,
    fd: RawFd,
    trigger: TriggerMode,
    interest: AtomicU32,
    state: Arc<IoState>,
    scheduler: Arc<Scheduler>,
    guard: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

// === impl IoChannel ===

impl IoChannel {
    pub fn new(fd: RawFd, trigger: TriggerMode, scheduler: Arc<Scheduler>) -> Self {
        let id = Scheduler::next_channel_id();
        let state = Arc::new(IoState::new(fd));

        let weak = Arc::downgrade(&state);
        let register_on = scheduler.clone();
        scheduler.schedule(move || {
            // the channel may already be gone by the time this runs
            if weak.upgrade().is_none() {
                return;
            }
            let handler_state: Weak<IoState> = weak.clone();
            let handler: Arc<IoHandler> = Arc::new(move |fd, ready| {
                if let Some(state) = handler_state.upgrade() {
                    debug_assert_eq!(fd, state.fd);
                    state.handle_events(ready);
                }
            });
            register_on.set_io_handler(id, fd, handler);
        });
        tracing::trace!(channel = id, fd, ?trigger, "io channel created");

        Self {
            id,
            fd,
            trigger,
            interest: AtomicU32::new(0),
            state,
            scheduler,
            guard: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[must_use]
    pub fn trigger_mode(&self) -> TriggerMode {
        self.trigger
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The currently enabled interest mask.
    #[must_use]
    pub fn events(&self) -> Interest {
        Interest::from_bits_retain(self.interest.load(Ordering::Acquire))
    }

    /// Keep `guard` alive until the channel's epoll deregistration has run,
    /// typically the owner of the underlying fd.
    pub fn set_guard(&self, guard: Arc<dyn Any + Send + Sync>) {
        *self.guard.lock().unwrap() = Some(guard);
    }

    pub fn enable_reading(&self) {
        self.add_interest(Interest::READABLE);
    }

    pub fn disable_reading(&self) {
        self.remove_interest(Interest::READABLE);
    }

    pub fn enable_writing(&self) {
        self.add_interest(Interest::WRITABLE);
    }

    pub fn disable_writing(&self) {
        self.remove_interest(Interest::WRITABLE);
    }

    pub fn disable_all(&self) {
        let prev = self.interest.swap(0, Ordering::AcqRel);
        if prev != 0 {
            self.sync_interest(Interest::empty());
        }
    }

    fn add_interest(&self, what: Interest) {
        let prev = self.interest.fetch_or(what.bits(), Ordering::AcqRel);
        if prev & what.bits() == 0 {
            self.sync_interest(Interest::from_bits_retain(prev | what.bits()));
        }
    }

    fn remove_interest(&self, what: Interest) {
        let prev = self.interest.fetch_and(!what.bits(), Ordering::AcqRel);
        if prev & what.bits() != 0 {
            self.sync_interest(Interest::from_bits_retain(prev & !what.bits()));
        }
    }

    /// Refresh the epoll registration; the actual `epoll_ctl` always runs
    /// on the scheduler thread, in submission order.
    fn sync_interest(&self, interest: Interest) {
        let (id, fd, trigger) = (self.id, self.fd, self.trigger);
        let scheduler = self.scheduler.clone();
        self.scheduler
            .dispatch(move || scheduler.update_io(id, fd, interest, trigger));
    }

    /// Cancel a pending read: the suspended task resumes with
    /// [`Error::Canceled`], and any later read on this channel fails the
    /// same way. Idempotent.
    pub fn cancel_read(&self) {
        let state = self.state.clone();
        self.scheduler.dispatch(move || {
            tracing::trace!(fd = state.fd, "read canceled");
            state.read_canceled.store(true, Ordering::Release);
            state.read_waiter.wake();
        });
    }

    /// Cancel a pending write, see [`cancel_read`][Self::cancel_read].
    pub fn cancel_write(&self) {
        let state = self.state.clone();
        self.scheduler.dispatch(move || {
            tracing::trace!(fd = state.fd, "write canceled");
            state.write_canceled.store(true, Ordering::Release);
            state.write_waiter.wake();
        });
    }

    pub fn cancel_all(&self) {
        self.cancel_read();
        self.cancel_write();
    }

    /// Drive `op` against the readable side of the fd until it reaches a
    /// terminal status, suspending whenever readiness is exhausted.
    ///
    /// `op` is invoked with `(fd, channel)` whenever the channel believes
    /// the fd is readable and may toggle interest on the channel (that is
    /// how non-blocking `connect` makes progress on the write side).
    ///
    /// # Errors
    ///
    /// [`Error::Canceled`] after [`cancel_read`][Self::cancel_read],
    /// [`Error::Disconnected`] on peer reset, [`Error::Io`] otherwise.
    pub async fn perform_read<F>(&self, mut op: F) -> Result<IoComplete, Error>
    where
        F: FnMut(RawFd, &IoChannel) -> IoStatus,
    {
        loop {
            if self.state.read_canceled.load(Ordering::Acquire) {
                return Err(Error::Canceled);
            }
            if !self.state.readable.load(Ordering::Acquire) {
                self.state.read_waiter.wait().await;
                continue;
            }
            match op(self.fd, self) {
                IoStatus::Success => {
                    if self.trigger == TriggerMode::LevelTriggered {
                        self.state.readable.store(false, Ordering::Release);
                    }
                    return Ok(IoComplete::Done);
                }
                IoStatus::Eof => return Ok(IoComplete::Eof),
                IoStatus::Retry => {}
                IoStatus::NeedRead => self.state.readable.store(false, Ordering::Release),
                IoStatus::NeedWrite => {
                    self.state.writable.store(false, Ordering::Release);
                    self.state.write_waiter.wait().await;
                }
                IoStatus::Disconnect => return Err(Error::Disconnected),
                IoStatus::Error(err) => return Err(Error::from_io(err)),
            }
        }
    }

    /// The write-side counterpart of [`perform_read`][Self::perform_read].
    ///
    /// # Errors
    ///
    /// [`Error::Canceled`] after [`cancel_write`][Self::cancel_write],
    /// [`Error::Disconnected`] on peer reset or broken pipe, [`Error::Io`]
    /// otherwise.
    pub async fn perform_write<F>(&self, mut op: F) -> Result<IoComplete, Error>
    where
        F: FnMut(RawFd, &IoChannel) -> IoStatus,
    {
        loop {
            if self.state.write_canceled.load(Ordering::Acquire) {
                return Err(Error::Canceled);
            }
            if !self.state.writable.load(Ordering::Acquire) {
                self.state.write_waiter.wait().await;
                continue;
            }
            match op(self.fd, self) {
                IoStatus::Success => {
                    if self.trigger == TriggerMode::LevelTriggered {
                        self.state.writable.store(false, Ordering::Release);
                    }
                    return Ok(IoComplete::Done);
                }
                IoStatus::Eof => return Ok(IoComplete::Eof),
                IoStatus::Retry => {}
                IoStatus::NeedWrite => self.state.writable.store(false, Ordering::Release),
                IoStatus::NeedRead => {
                    self.state.readable.store(false, Ordering::Release);
                    self.state.read_waiter.wait().await;
                }
                IoStatus::Disconnect => return Err(Error::Disconnected),
                IoStatus::Error(err) => return Err(Error::from_io(err)),
            }
        }
    }
}

impl Drop for IoChannel {
    fn drop(&mut self) {
        tracing::trace!(channel = self.id, fd = self.fd, "io channel dropped");
        let id = self.id;
        let scheduler = self.scheduler.clone();
        let guard = self.guard.lock().unwrap().take();
        self.scheduler.schedule(move || {
            scheduler.remove_io(id);
            drop(guard);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::cvt;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) })
            .expect("pipe2 failed");
        // Safety: pipe2 returned two fresh fds we now own
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default()
    }

    #[test]
    fn read_resumes_on_readiness() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let (rx, tx) = pipe();
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));

        scheduler.spawn({
            let scheduler = scheduler.clone();
            let received = received.clone();
            async move {
                let rx = Arc::new(rx);
                let channel = IoChannel::new(rx.as_raw_fd(), TriggerMode::EdgeTriggered, scheduler.clone());
                channel.set_guard(rx.clone());
                channel.enable_reading();

                let mut buf = [0u8; 16];
                let mut count = 0usize;
                channel
                    .perform_read(|fd, _channel| {
                        let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                        if ret > 0 {
                            count = ret as usize;
                            IoStatus::Success
                        } else if ret == 0 {
                            IoStatus::Eof
                        } else {
                            IoStatus::NeedRead
                        }
                    })
                    .await
                    .unwrap();
                received.lock().unwrap().extend_from_slice(&buf[..count]);
                scheduler.stop();
            }
        });
        scheduler.spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler.sleep_for(Duration::from_millis(10)).await;
                let payload = b"ping";
                unsafe { libc::write(tx.as_raw_fd(), payload.as_ptr().cast(), payload.len()) };
                // keep the write end open until after the reader ran
                scheduler.sleep_for(Duration::from_millis(30)).await;
                drop(tx);
            }
        });
        scheduler.run();

        assert_eq!(*received.lock().unwrap(), b"ping");
    }

    #[test]
    fn cancel_read_unblocks_the_waiter() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let (rx, _tx) = pipe();
        let canceled = Arc::new(AtomicUsize::new(0));

        let rx = Arc::new(rx);
        let channel = Arc::new(IoChannel::new(
            rx.as_raw_fd(),
            TriggerMode::EdgeTriggered,
            scheduler.clone(),
        ));
        channel.set_guard(rx.clone());
        channel.enable_reading();

        scheduler.spawn({
            let scheduler = scheduler.clone();
            let channel = channel.clone();
            let canceled = canceled.clone();
            async move {
                let result = channel.perform_read(|_fd, _channel| IoStatus::NeedRead).await;
                assert!(matches!(result, Err(Error::Canceled)));
                canceled.fetch_add(1, Ordering::Relaxed);
                scheduler.stop();
            }
        });
        scheduler.spawn({
            let scheduler = scheduler.clone();
            let channel = channel.clone();
            async move {
                scheduler.sleep_for(Duration::from_millis(10)).await;
                channel.cancel_read();
            }
        });
        scheduler.run();

        assert_eq!(canceled.load(Ordering::Relaxed), 1);
    }
}
