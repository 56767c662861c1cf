// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::io::{Interest, Ready, TriggerMode};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Epoll user-data key reserved for the scheduler's wakeup eventfd. Channel
/// ids start at 1 so they can never collide with it.
pub(crate) const WAKEUP_TOKEN: u64 = 0;

const MAX_EVENTS: usize = 128;

/// Callback invoked on the scheduler thread with `(fd, readiness)` when
/// epoll reports events for a registered channel.
pub(crate) type IoHandler = dyn Fn(RawFd, Ready) + Send + Sync;

pub(crate) fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

/// Per-channel registration record.
///
/// Created by whichever of `set_handler`/`update` runs first; removed only
/// by an explicit `remove`. The `added_to_epoll` flag tracks whether the fd
/// is currently known to the kernel so interest changes pick the right
/// `epoll_ctl` op.
struct IoContext {
    fd: RawFd,
    handler: Option<Arc<IoHandler>>,
    added_to_epoll: bool,
}

/// The epoll instance plus the id-keyed channel registry.
///
/// Epoll user data always carries the channel id, never the fd: fds are
/// reused by the kernel, ids are unique for the life of the scheduler.
/// All methods except construction must run on the scheduler thread.
pub(crate) struct Reactor {
    epoll: OwnedFd,
    contexts: HashMap<u64, IoContext>,
    events: Vec<libc::epoll_event>,
}

// === impl Reactor ===

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            // Safety: epoll_create1 returned a fresh fd we now own
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            contexts: HashMap::new(),
            events: Vec::with_capacity(MAX_EVENTS),
        })
    }

    pub(crate) fn register_wakeup(&mut self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKEUP_TOKEN,
        };
        cvt(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) })?;
        Ok(())
    }

    /// Block for up to `timeout_ms` and return the raised `(id, readiness)`
    /// pairs. Poll failures are logged and reported as an empty batch, the
    /// event loop is expected to carry on.
    pub(crate) fn wait(&mut self, timeout_ms: i32) -> Vec<(u64, Ready)> {
        self.events.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                tracing::warn!(error = %err, "epoll_wait failed");
            }
            return Vec::new();
        }
        // Safety: the kernel initialized the first `n` entries
        unsafe { self.events.set_len(n as usize) };
        self.events
            .iter()
            .map(|ev| {
                let id = ev.u64;
                let ready = Ready::from_bits_retain(ev.events);
                (id, ready)
            })
            .collect()
    }

    pub(crate) fn set_handler(&mut self, id: u64, fd: RawFd, handler: Arc<IoHandler>) {
        match self.contexts.entry(id) {
            Entry::Occupied(mut entry) => {
                debug_assert!(
                    entry.get().handler.is_none(),
                    "handler installed twice for channel {id}"
                );
                entry.get_mut().handler = Some(handler);
            }
            Entry::Vacant(entry) => {
                entry.insert(IoContext {
                    fd,
                    handler: Some(handler),
                    added_to_epoll: false,
                });
            }
        }
    }

    pub(crate) fn handler(&self, id: u64) -> Option<(RawFd, Arc<IoHandler>)> {
        let ctx = self.contexts.get(&id)?;
        Some((ctx.fd, ctx.handler.clone()?))
    }

    pub(crate) fn update(&mut self, id: u64, fd: RawFd, interest: Interest, mode: TriggerMode) {
        let ctx = self.contexts.entry(id).or_insert(IoContext {
            fd,
            handler: None,
            added_to_epoll: false,
        });

        if interest.is_empty() {
            if ctx.added_to_epoll {
                if let Err(err) = epoll_ctl(&self.epoll, libc::EPOLL_CTL_DEL, fd, 0, id) {
                    tracing::warn!(channel = id, fd, error = %err, "EPOLL_CTL_DEL failed");
                }
                ctx.added_to_epoll = false;
            }
            return;
        }

        let mut bits = interest.bits();
        if mode == TriggerMode::EdgeTriggered {
            bits |= libc::EPOLLET as u32;
        }
        let op = if ctx.added_to_epoll {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        match epoll_ctl(&self.epoll, op, fd, bits, id) {
            Ok(()) => ctx.added_to_epoll = true,
            Err(err) => tracing::error!(channel = id, fd, error = %err, "epoll_ctl failed"),
        }
    }

    pub(crate) fn remove(&mut self, id: u64) {
        let Some(ctx) = self.contexts.remove(&id) else {
            tracing::trace!(channel = id, "remove of unknown channel");
            return;
        };
        if ctx.added_to_epoll {
            if let Err(err) = epoll_ctl(&self.epoll, libc::EPOLL_CTL_DEL, ctx.fd, 0, id) {
                tracing::warn!(channel = id, fd = ctx.fd, error = %err, "EPOLL_CTL_DEL failed");
            }
        }
    }
}

fn epoll_ctl(epoll: &OwnedFd, op: libc::c_int, fd: RawFd, events: u32, id: u64) -> io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: id };
    cvt(unsafe { libc::epoll_ctl(epoll.as_raw_fd(), op, fd, &mut ev) })?;
    Ok(())
}

/// Eventfd the scheduler polls alongside real fds so foreign threads can
/// unblock `epoll_wait`.
pub(crate) struct WakeFd(OwnedFd);

// === impl WakeFd ===

impl WakeFd {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        // Safety: eventfd returned a fresh fd we now own
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    pub(crate) fn notify(&self) {
        let one: u64 = 1;
        // A full counter (EAGAIN) still leaves the fd readable, which is all
        // we need, so the result is intentionally ignored.
        unsafe {
            libc::write(self.0.as_raw_fd(), (&raw const one).cast(), 8);
        }
    }

    pub(crate) fn drain(&self) {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(self.0.as_raw_fd(), (&raw mut counter).cast(), 8);
        }
    }
}
