// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Shared worker pool backing the pool fibers.

use std::{
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	thread,
	time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{CoreError, Result};

/// Interval for checking the shutdown flag during blocked recv.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

type Job = Box<dyn FnOnce() + Send>;

/// A fixed set of worker threads consuming one shared job queue.
///
/// Jobs run under `catch_unwind`: a panicking job is logged and terminated
/// without taking the worker down. After [`WorkerPool::shutdown`], submission
/// fails with [`CoreError::ExecutorRejected`].
#[derive(Clone)]
pub struct WorkerPool {
	inner: Arc<PoolInner>,
}

struct PoolInner {
	tx: Sender<Job>,
	shutdown: Arc<AtomicBool>,
	workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
	pub fn new(workers: usize) -> Self {
		let (tx, rx) = unbounded::<Job>();
		let shutdown = Arc::new(AtomicBool::new(false));

		let mut handles = Vec::new();
		for i in 0..workers.max(1) {
			let rx = rx.clone();
			let shutdown = shutdown.clone();
			let handle = thread::Builder::new()
				.name(format!("weft-worker-{i}"))
				.spawn(move || worker_loop(rx, shutdown))
				.expect("failed to spawn worker thread");
			handles.push(handle);
		}

		Self {
			inner: Arc::new(PoolInner {
				tx,
				shutdown,
				workers: Mutex::new(handles),
			}),
		}
	}

	pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
		if self.inner.shutdown.load(Ordering::Acquire) {
			return Err(CoreError::ExecutorRejected);
		}
		self.inner
			.tx
			.send(Box::new(job))
			.map_err(|_| CoreError::ExecutorRejected)
	}

	pub fn is_shutdown(&self) -> bool {
		self.inner.shutdown.load(Ordering::Acquire)
	}

	/// Stop accepting work and join the workers. Idempotent.
	pub fn shutdown(&self) {
		if self.inner.shutdown.swap(true, Ordering::AcqRel) {
			return;
		}
		let mut workers = self.inner.workers.lock().unwrap();
		for handle in workers.drain(..) {
			let _ = handle.join();
		}
	}
}

fn worker_loop(rx: Receiver<Job>, shutdown: Arc<AtomicBool>) {
	tracing::debug!("worker thread starting");
	loop {
		if shutdown.load(Ordering::Acquire) {
			break;
		}
		match rx.recv_timeout(SHUTDOWN_CHECK_INTERVAL) {
			Ok(job) => {
				if catch_unwind(AssertUnwindSafe(job)).is_err() {
					tracing::error!("worker task panicked; task terminated");
				}
			}
			Err(RecvTimeoutError::Timeout) => continue,
			Err(RecvTimeoutError::Disconnected) => break,
		}
	}
	tracing::debug!("worker thread stopped");
}
