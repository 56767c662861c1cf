// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod mutex;
mod promise;
pub(crate) mod wait_cell;

pub use mutex::{Lock, Mutex, MutexGuard, ScopedLock};
pub use promise::{Future, Promise, SharedFuture};
