// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::io::{IoChannel, IoComplete, IoStatus, TriggerMode};
use crate::net::socket;
use crate::scheduler::Scheduler;
use crate::sync::Mutex;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

/// A connected stream socket bound to a scheduler.
///
/// The connection owns its fd and an edge-triggered [`IoChannel`] on it;
/// reading interest is enabled from the start. Reads are serialized by the
/// channel's single-reader contract; concurrent writers are serialized by
/// an internal task mutex, so a logical message written by one task is
/// never interleaved with another's.
pub struct TcpConnection {
    // declared before `socket` so the channel schedules its deregistration
    // first; the guard keeps the fd alive until that has run
    channel: IoChannel,
    socket: Arc<OwnedFd>,
    write_lock: Mutex,
}

// === impl TcpConnection ===

impl TcpConnection {
    pub(crate) fn new(socket: OwnedFd, scheduler: Arc<Scheduler>) -> Arc<Self> {
        let socket = Arc::new(socket);
        let channel = IoChannel::new(socket.as_raw_fd(), TriggerMode::EdgeTriggered, scheduler);
        channel.set_guard(socket.clone());
        channel.enable_reading();
        Arc::new(Self {
            channel,
            socket,
            write_lock: Mutex::new(),
        })
    }

    /// Connect to `addr` without blocking the thread, driving the
    /// non-blocking connect state machine through the channel's write side.
    ///
    /// Must be called from a task on the current thread's scheduler.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be created or the connect is refused.
    pub async fn connect(addr: SocketAddr) -> Result<Arc<Self>, Error> {
        let scheduler = Scheduler::current();
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let socket = Arc::new(socket::stream_socket(family)?);
        let channel = IoChannel::new(socket.as_raw_fd(), TriggerMode::EdgeTriggered, scheduler);
        channel.set_guard(socket.clone());

        let mut in_progress = false;
        channel
            .perform_write(|fd, channel| {
                if in_progress {
                    // a previous attempt went asynchronous; the verdict is
                    // in SO_ERROR now that the fd turned writable
                    return match socket::take_socket_error(fd) {
                        Ok(0) => {
                            channel.disable_writing();
                            IoStatus::Success
                        }
                        Ok(libc::EINPROGRESS | libc::EALREADY) => IoStatus::NeedWrite,
                        Ok(code) => IoStatus::Error(io::Error::from_raw_os_error(code)),
                        Err(err) => IoStatus::Error(err),
                    };
                }
                match socket::connect(fd, &addr) {
                    Ok(()) => {
                        channel.disable_writing();
                        IoStatus::Success
                    }
                    Err(err) => match err.raw_os_error() {
                        Some(libc::EISCONN) => {
                            channel.disable_writing();
                            IoStatus::Success
                        }
                        Some(libc::EINPROGRESS | libc::EALREADY) => {
                            in_progress = true;
                            channel.enable_writing();
                            IoStatus::NeedWrite
                        }
                        Some(libc::EINTR) => IoStatus::Retry,
                        _ => IoStatus::Error(err),
                    },
                }
            })
            .await?;
        tracing::debug!(fd = socket.as_raw_fd(), %addr, "connected");

        channel.enable_reading();
        Ok(Arc::new(Self {
            channel,
            socket,
            write_lock: Mutex::new(),
        }))
    }

    /// Read once from the socket into `buf`.
    ///
    /// Returns the number of bytes read, or `Ok(0)` on clean end of
    /// stream.
    ///
    /// # Errors
    ///
    /// [`Error::Disconnected`] on peer reset, [`Error::Canceled`] after
    /// [`force_close`][Self::force_close], [`Error::Io`] otherwise.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut count = 0usize;
        let complete = self
            .channel
            .perform_read(|fd, _channel| {
                if buf.is_empty() {
                    return IoStatus::Success;
                }
                let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                if ret > 0 {
                    count = ret as usize;
                    IoStatus::Success
                } else if ret == 0 {
                    IoStatus::Eof
                } else {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => IoStatus::NeedRead,
                        Some(libc::EINTR) => IoStatus::Retry,
                        Some(libc::ECONNRESET | libc::EPIPE) => IoStatus::Disconnect,
                        _ => IoStatus::Error(err),
                    }
                }
            })
            .await?;
        match complete {
            IoComplete::Eof => Ok(0),
            IoComplete::Done => Ok(count),
        }
    }

    /// Write all of `buf` to the socket, suspending whenever the kernel
    /// buffer is full.
    ///
    /// # Errors
    ///
    /// [`Error::Disconnected`] on broken pipe or peer reset,
    /// [`Error::Canceled`] after [`force_close`][Self::force_close],
    /// [`Error::Io`] otherwise.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        let _guard = self.write_lock.scoped_lock().await;
        let mut written = 0usize;
        self.channel
            .perform_write(|fd, channel| {
                if buf.is_empty() {
                    return IoStatus::Success;
                }
                let ret = unsafe {
                    libc::write(fd, buf[written..].as_ptr().cast(), buf.len() - written)
                };
                if ret > 0 {
                    written += ret as usize;
                    if written == buf.len() {
                        channel.disable_writing();
                        IoStatus::Success
                    } else {
                        IoStatus::Retry
                    }
                } else if ret == 0 {
                    IoStatus::Retry
                } else {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => {
                            channel.enable_writing();
                            IoStatus::NeedWrite
                        }
                        Some(libc::EINTR) => IoStatus::Retry,
                        Some(libc::EPIPE | libc::ECONNRESET) => IoStatus::Disconnect,
                        _ => IoStatus::Error(err),
                    }
                }
            })
            .await?;
        Ok(written)
    }

    /// Half-close the write side; the peer observes end of stream after
    /// draining what was already sent.
    ///
    /// # Errors
    ///
    /// Propagates the OS failure, e.g. when the socket is already gone.
    pub async fn shutdown(&self) -> Result<(), Error> {
        socket::shutdown_write(self.socket.as_raw_fd())?;
        Ok(())
    }

    /// Tear the connection down: disable all epoll interest and cancel any
    /// suspended reader or writer. The socket itself closes when the last
    /// owner lets go.
    pub async fn force_close(&self) {
        self.channel.disable_all();
        self.channel.cancel_all();
    }

    /// Alias for [`force_close`][Self::force_close], the shape the server's
    /// shutdown path uses.
    pub async fn close(&self) {
        self.force_close().await;
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.channel.scheduler()
    }
}
