// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Failure surfaced by channel operations, connection I/O and promises.
///
/// Would-block and interrupted conditions never show up here, they drive
/// suspension and retry inside the readiness loops instead. The error is
/// cheaply cloneable so a single outcome can fan out through a
/// [`SharedFuture`](crate::sync::SharedFuture) to any number of consumers.
#[derive(Debug, Clone)]
pub enum Error {
    /// The pending operation was canceled through one of the channel's
    /// `cancel_*` methods.
    Canceled,
    /// The peer reset the connection, or the local end hit a broken pipe.
    Disconnected,
    /// Any other operating system failure.
    Io(Arc<io::Error>),
}

// === impl Error ===

impl Error {
    pub(crate) fn from_io(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }

    /// Returns `true` if this error was produced by cancellation.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Canceled => f.write_str("operation canceled"),
            Error::Disconnected => f.write_str("peer disconnected"),
            Error::Io(err) => write!(f, "i/o error: {err}"),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(&**err),
            _ => None,
        }
    }
}
