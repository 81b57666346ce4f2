// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Core execution primitives for weft.
//!
//! A [`Reactor`] is a single-threaded cooperative executor bound to a poll
//! selector: all I/O callbacks, timers, and posted tasks for its sockets run
//! on the reactor thread. A [`PoolFiber`] is a serializing executor on top of
//! a shared [`WorkerPool`]: tasks posted to one fiber run one at a time and
//! in posting order, though not necessarily on the same worker thread.

mod error;
mod fiber;
mod pool;
mod reactor;

pub use error::{CoreError, Result};
pub use fiber::PoolFiber;
pub use pool::WorkerPool;
pub use reactor::{Reactor, ReactorCore, ReactorHandle, SelectCx, SelectHandler, TimerHandle};
