// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::io::{IoChannel, IoComplete, IoStatus, TriggerMode};
use crate::net::TcpConnection;
use crate::net::socket;
use crate::scheduler::Scheduler;
use crate::sync::{Promise, SharedFuture};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

const BACKLOG: libc::c_int = 128;

type ConnectionSet = Mutex<HashMap<usize, Arc<TcpConnection>>>;

/// A TCP accept loop with lifecycle tracking of in-flight connections and
/// graceful shutdown.
///
/// Lifecycle: created → [`start`][Self::start] (resolves once stopped) →
/// [`stop`][Self::stop] → observed via [`wait`][Self::wait].
pub struct TcpServer {
    scheduler: Arc<Scheduler>,
    socket: Arc<OwnedFd>,
    port: u16,
    started: AtomicBool,
    stopped: AtomicBool,
    stop_promise: Promise<()>,
    stop_future: SharedFuture<()>,
    listen_channel: Mutex<Option<Arc<IoChannel>>>,
    connections: Arc<ConnectionSet>,
}

// === impl TcpServer ===

impl TcpServer {
    /// Bind a non-blocking listen socket (with `SO_REUSEADDR` and
    /// `SO_REUSEPORT`) to `port`; 0 picks an ephemeral port, resolved via
    /// [`port`][Self::port].
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be created or bound.
    pub fn new(port: u16, scheduler: Arc<Scheduler>) -> io::Result<Arc<Self>> {
        let socket = socket::listener(port)?;
        let port = socket::local_port(socket.as_raw_fd())?;
        let stop_promise = Promise::with_scheduler(scheduler.clone());
        let stop_future = stop_promise.get_future().share();
        Ok(Arc::new(Self {
            scheduler,
            socket: Arc::new(socket),
            port,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_promise,
            stop_future,
            listen_channel: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    /// The locally bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the accept loop, spawning `handler` for every accepted
    /// connection. Resolves only after [`stop`][Self::stop] was requested
    /// and the loop has fully unwound.
    ///
    /// The handler receives an owning reference to the live connection and
    /// may outlive the accept loop by holding onto it; the server imposes
    /// no timeout and no connection limit.
    ///
    /// # Errors
    ///
    /// Fails when `listen` fails; accept failures are logged and end the
    /// loop.
    ///
    /// # Panics
    ///
    /// Panics when called a second time.
    pub async fn start<H, F>(self: Arc<Self>, handler: H) -> Result<(), Error>
    where
        H: Fn(Arc<TcpConnection>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "TcpServer already started"
        );

        if let Err(err) = socket::listen(self.socket.as_raw_fd(), BACKLOG) {
            self.stopped.store(true, Ordering::Release);
            self.stop_promise.set_value(());
            return Err(Error::from(err));
        }
        tracing::info!(port = self.port, "tcp server listening");

        let channel = Arc::new(IoChannel::new(
            self.socket.as_raw_fd(),
            TriggerMode::LevelTriggered,
            self.scheduler.clone(),
        ));
        channel.set_guard(self.socket.clone());
        *self.listen_channel.lock().unwrap() = Some(channel.clone());
        channel.enable_reading();

        let handler = Arc::new(handler);
        while !self.stopped.load(Ordering::Acquire) {
            let mut accepted: Option<OwnedFd> = None;
            let result = channel
                .perform_read(|fd, _channel| match socket::accept(fd) {
                    Ok(client) => {
                        accepted = Some(client);
                        IoStatus::Success
                    }
                    Err(err) => match err.raw_os_error() {
                        Some(libc::EAGAIN) => IoStatus::NeedRead,
                        Some(libc::EINTR) => IoStatus::Retry,
                        _ => IoStatus::Error(err),
                    },
                })
                .await;
            match result {
                Ok(IoComplete::Done) => {}
                Ok(IoComplete::Eof) => break,
                Err(Error::Canceled) => {
                    tracing::debug!("accept loop canceled");
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "accept failed");
                    break;
                }
            }
            let Some(client) = accepted else { continue };

            tracing::debug!(fd = client.as_raw_fd(), "accepted connection");
            let connection = TcpConnection::new(client, self.scheduler.clone());
            let key = Arc::as_ptr(&connection) as usize;
            self.connections
                .lock()
                .unwrap()
                .insert(key, connection.clone());

            // the task only keeps a weak reference to the set so it never
            // extends the server's lifetime
            let connections = Arc::downgrade(&self.connections);
            let handler = handler.clone();
            self.scheduler.spawn(async move {
                if let Err(err) = (*handler)(connection.clone()).await {
                    tracing::error!(error = %err, "connection handler failed");
                }
                remove_connection(&connections, key);
                connection.close().await;
            });
        }

        channel.disable_all();
        *self.listen_channel.lock().unwrap() = None;
        self.stop_promise.set_value(());
        tracing::info!(port = self.port, "tcp server stopped");
        Ok(())
    }

    /// Request shutdown and wait for it to finish: unblocks the accept
    /// loop, closes every live connection and resolves once
    /// [`start`][Self::start] has unwound. Idempotent; a second call
    /// returns immediately.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(port = self.port, "tcp server stop requested");

        let channel = self.listen_channel.lock().unwrap().clone();
        if let Some(channel) = channel {
            channel.disable_all();
            channel.cancel_all();
        }

        let connections: Vec<_> = self
            .connections
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for connection in connections {
            connection.close().await;
        }

        let _ = self.stop_future.clone().await;
    }

    /// Wait for the server to stop without requesting it.
    pub async fn wait(&self) {
        let _ = self.stop_future.clone().await;
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

fn remove_connection(connections: &Weak<ConnectionSet>, key: usize) {
    if let Some(connections) = connections.upgrade() {
        connections.lock().unwrap().remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default()
    }

    async fn echo(connection: Arc<TcpConnection>) -> Result<(), Error> {
        let mut buf = [0u8; 256];
        loop {
            let n = connection.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            connection.write(&buf[..n]).await?;
        }
    }

    async fn read_exactly(
        connection: &TcpConnection,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let mut total = 0;
        while total < buf.len() {
            let n = connection.read(&mut buf[total..]).await?;
            assert!(n > 0, "peer closed before the full message arrived");
            total += n;
        }
        Ok(())
    }

    #[test]
    fn echoes_one_client() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let server = TcpServer::new(0, scheduler.clone()).unwrap();
        let port = server.port();
        let echoed = Arc::new(Mutex::new(Vec::new()));

        scheduler.spawn({
            let server = server.clone();
            async move {
                server.start(echo).await.unwrap();
            }
        });
        scheduler.spawn({
            let scheduler = scheduler.clone();
            let server = server.clone();
            let echoed = echoed.clone();
            async move {
                let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
                let connection = TcpConnection::connect(addr).await.unwrap();
                connection.write(b"hello").await.unwrap();
                let mut buf = [0u8; 5];
                read_exactly(&connection, &mut buf).await.unwrap();
                echoed.lock().unwrap().extend_from_slice(&buf);

                connection.shutdown().await.unwrap();
                server.stop().await;
                scheduler.stop();
            }
        });
        scheduler.run();

        assert_eq!(*echoed.lock().unwrap(), b"hello");
    }

    #[test]
    fn echoes_five_concurrent_clients() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let server = TcpServer::new(0, scheduler.clone()).unwrap();
        let port = server.port();
        let matched = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        scheduler.spawn({
            let server = server.clone();
            async move {
                server.start(echo).await.unwrap();
            }
        });
        for i in 0..5usize {
            let scheduler2 = scheduler.clone();
            let server = server.clone();
            let matched = matched.clone();
            let finished = finished.clone();
            scheduler.spawn(async move {
                let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
                let connection = TcpConnection::connect(addr).await.unwrap();
                let message = format!("client{i}");
                connection.write(message.as_bytes()).await.unwrap();
                let mut buf = vec![0u8; message.len()];
                read_exactly(&connection, &mut buf).await.unwrap();
                if buf == message.as_bytes() {
                    matched.fetch_add(1, Ordering::Relaxed);
                }
                connection.shutdown().await.unwrap();

                if finished.fetch_add(1, Ordering::Relaxed) == 4 {
                    server.stop().await;
                    scheduler2.stop();
                }
            });
        }
        scheduler.run();

        assert_eq!(matched.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn stop_resolves_after_the_loop_unwound() {
        let _trace = trace();
        let scheduler = Scheduler::new().unwrap();
        let server = TcpServer::new(0, scheduler.clone()).unwrap();
        let unwound = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(0));

        scheduler.spawn({
            let server = server.clone();
            let unwound = unwound.clone();
            async move {
                server.start(echo).await.unwrap();
                unwound.fetch_add(1, Ordering::Relaxed);
            }
        });
        scheduler.spawn({
            let scheduler = scheduler.clone();
            let server = server.clone();
            let observed = observed.clone();
            async move {
                // let the accept loop spin up first
                scheduler.sleep_for(std::time::Duration::from_millis(10)).await;
                server.stop().await;
                observed.fetch_add(1, Ordering::Relaxed);
                server.wait().await;
                scheduler.stop();
            }
        });
        scheduler.run();

        assert_eq!(unwound.load(Ordering::Relaxed), 1);
        assert_eq!(observed.load(Ordering::Relaxed), 1);
    }
}
