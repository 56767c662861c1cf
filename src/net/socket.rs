// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::reactor::cvt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Create a non-blocking, close-on-exec stream socket.
pub(crate) fn stream_socket(family: libc::c_int) -> io::Result<OwnedFd> {
    let fd = cvt(unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })?;
    // Safety: socket returned a fresh fd we now own
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Create a non-blocking IPv4 listen socket bound to `port` on all
/// interfaces; port 0 picks an ephemeral one.
pub(crate) fn listener(port: u16) -> io::Result<OwnedFd> {
    let socket = stream_socket(libc::AF_INET)?;
    let fd = socket.as_raw_fd();

    set_reuse(fd)?;

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_ANY;
    addr.sin_port = port.to_be();
    cvt(unsafe {
        libc::bind(
            fd,
            (&raw const addr).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })?;

    Ok(socket)
}

fn set_reuse(fd: RawFd) -> io::Result<()> {
    let opt: libc::c_int = 1;
    for name in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
        cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                name,
                (&raw const opt).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
    cvt(unsafe { libc::listen(fd, backlog) })?;
    Ok(())
}

/// Accept one pending connection; the client fd comes back non-blocking and
/// close-on-exec.
pub(crate) fn accept(fd: RawFd) -> io::Result<OwnedFd> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let client = cvt(unsafe {
        libc::accept4(
            fd,
            (&raw mut storage).cast(),
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })?;
    // Safety: accept4 returned a fresh fd we now own
    Ok(unsafe { OwnedFd::from_raw_fd(client) })
}

pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = sockaddr_from(addr);
    cvt(unsafe { libc::connect(fd, (&raw const storage).cast(), len) })?;
    Ok(())
}

/// Fetch and clear the socket's pending error, used to learn the outcome of
/// a non-blocking connect.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<libc::c_int> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut err).cast(),
            &mut len,
        )
    })?;
    Ok(err)
}

/// Half-close the write side.
pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::shutdown(fd, libc::SHUT_WR) })?;
    Ok(())
}

/// The locally bound port, resolving an ephemeral bind.
pub(crate) fn local_port(fd: RawFd) -> io::Result<u16> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe { libc::getsockname(fd, (&raw mut storage).cast(), &mut len) })?;
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            // Safety: the kernel filled in a sockaddr_in for AF_INET
            let addr = unsafe { &*(&raw const storage).cast::<libc::sockaddr_in>() };
            Ok(u16::from_be(addr.sin_port))
        }
        libc::AF_INET6 => {
            // Safety: the kernel filled in a sockaddr_in6 for AF_INET6
            let addr = unsafe { &*(&raw const storage).cast::<libc::sockaddr_in6>() };
            Ok(u16::from_be(addr.sin6_port))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported socket family {family}"),
        )),
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // Safety: sockaddr_in fits inside sockaddr_storage
            let sin = unsafe { &mut *(&raw mut storage).cast::<libc::sockaddr_in>() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            // Safety: sockaddr_in6 fits inside sockaddr_storage
            let sin6 = unsafe { &mut *(&raw mut storage).cast::<libc::sockaddr_in6>() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}
