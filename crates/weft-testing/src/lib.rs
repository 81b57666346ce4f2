// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Test support for weft.
//!
//! `busy_wait` polls a condition without fixed sleeps; [`EventSink`] records
//! callback events with latch-style waiting so tests can assert exact counts.

use std::{
	sync::{Condvar, Mutex},
	thread,
	time::{Duration, Instant},
};

/// Default timeout for wait operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Poll `ready` until it yields a value, panicking after [`DEFAULT_TIMEOUT`].
pub fn busy_wait<T>(ready: impl FnMut() -> Option<T>) -> T {
	busy_wait_with(DEFAULT_TIMEOUT, ready)
}

/// Poll `ready` until it yields a value, panicking after `timeout`.
pub fn busy_wait_with<T>(timeout: Duration, mut ready: impl FnMut() -> Option<T>) -> T {
	let start = Instant::now();
	loop {
		if let Some(value) = ready() {
			return value;
		}
		if start.elapsed() > timeout {
			panic!("busy_wait timed out after {:?}", timeout);
		}
		thread::sleep(POLL_INTERVAL);
	}
}

/// Thread-safe event recorder with latch semantics.
///
/// Callbacks under test push into the sink; the test thread waits for an
/// exact count and inspects what arrived.
pub struct EventSink<T> {
	events: Mutex<Vec<T>>,
	arrived: Condvar,
}

impl<T> Default for EventSink<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> EventSink<T> {
	pub fn new() -> Self {
		Self {
			events: Mutex::new(Vec::new()),
			arrived: Condvar::new(),
		}
	}

	pub fn push(&self, event: T) {
		self.events.lock().unwrap().push(event);
		self.arrived.notify_all();
	}

	pub fn count(&self) -> usize {
		self.events.lock().unwrap().len()
	}

	/// Drain everything recorded so far.
	pub fn take(&self) -> Vec<T> {
		std::mem::take(&mut *self.events.lock().unwrap())
	}

	/// Block until at least `expected` events arrived, panicking after
	/// [`DEFAULT_TIMEOUT`].
	pub fn wait_for(&self, expected: usize) -> usize {
		self.wait_for_with(expected, DEFAULT_TIMEOUT)
	}

	pub fn wait_for_with(&self, expected: usize, timeout: Duration) -> usize {
		let deadline = Instant::now() + timeout;
		let mut events = self.events.lock().unwrap();
		while events.len() < expected {
			let now = Instant::now();
			if now >= deadline {
				panic!(
					"expected {} events, saw {} after {:?}",
					expected,
					events.len(),
					timeout
				);
			}
			let (guard, _) = self
				.arrived
				.wait_timeout(events, deadline - now)
				.unwrap();
			events = guard;
		}
		events.len()
	}
}

impl<T: Clone> EventSink<T> {
	/// Snapshot of everything recorded so far.
	pub fn snapshot(&self) -> Vec<T> {
		self.events.lock().unwrap().clone()
	}
}
