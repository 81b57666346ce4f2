// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! The pool fiber: a single-consumer serializing queue on top of the shared
//! worker pool.
//!
//! When the queue goes empty→non-empty a worker is claimed; when it drains
//! the worker is returned. Tasks for one fiber never run concurrently and
//! always run in posting order.

use std::{
	collections::VecDeque,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use crate::{
	error::Result,
	pool::WorkerPool,
	reactor::{ReactorHandle, TimerHandle},
};

/// Maximum tasks drained per worker claim before yielding the worker.
const BATCH_SIZE: usize = 64;

type Task = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct PoolFiber {
	shared: Arc<FiberShared>,
}

struct FiberShared {
	queue: Mutex<VecDeque<Task>>,
	scheduled: AtomicBool,
	pool: WorkerPool,
	scheduler: ReactorHandle,
}

impl PoolFiber {
	/// `scheduler` provides the time source for [`PoolFiber::schedule_with_fixed_delay`];
	/// the scheduled task itself still runs on the fiber.
	pub fn new(pool: WorkerPool, scheduler: ReactorHandle) -> Self {
		Self {
			shared: Arc::new(FiberShared {
				queue: Mutex::new(VecDeque::new()),
				scheduled: AtomicBool::new(false),
				pool,
				scheduler,
			}),
		}
	}

	/// Enqueue a task. Fails with `ExecutorRejected` when the backing pool is
	/// shutting down.
	pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
		self.shared.queue.lock().unwrap().push_back(Box::new(task));
		self.claim_worker()
	}

	/// Run `task` on this fiber after `initial`, then `period` after each
	/// completion. The returned handle cancels idempotently.
	pub fn schedule_with_fixed_delay(
		&self,
		initial: Duration,
		period: Duration,
		task: impl Fn() + Send + Sync + 'static,
	) -> TimerHandle {
		let fiber = self.clone();
		let task = Arc::new(task);
		self.shared
			.scheduler
			.schedule_with_fixed_delay(initial, period, move || {
				let task = task.clone();
				let _ = fiber.execute(move || task());
			})
	}

	fn claim_worker(&self) -> Result<()> {
		if self
			.shared
			.scheduled
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
		{
			let shared = self.shared.clone();
			if let Err(rejected) = self.shared.pool.execute(move || drain(&shared)) {
				self.shared.scheduled.store(false, Ordering::Release);
				return Err(rejected);
			}
		}
		Ok(())
	}
}

fn drain(shared: &Arc<FiberShared>) {
	loop {
		let mut ran = 0;
		while ran < BATCH_SIZE {
			let task = shared.queue.lock().unwrap().pop_front();
			let Some(task) = task else {
				break;
			};
			if catch_unwind(AssertUnwindSafe(task)).is_err() {
				tracing::error!("fiber task panicked; task terminated");
			}
			ran += 1;
		}

		if ran == BATCH_SIZE {
			// yield the worker for fairness, keep the claim
			let resubmit = shared.clone();
			if shared.pool.execute(move || drain(&resubmit)).is_ok() {
				return;
			}
			// pool is shutting down: keep draining inline
			continue;
		}

		shared.scheduled.store(false, Ordering::Release);
		if shared.queue.lock().unwrap().is_empty() {
			return;
		}
		// a producer enqueued between the drain and the flag reset
		if shared
			.scheduled
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicU32;

	use weft_testing::busy_wait;

	use super::*;
	use crate::{CoreError, Reactor};

	#[test]
	fn test_tasks_run_in_posting_order() {
		let reactor = Reactor::spawn("test-reactor").unwrap();
		let pool = WorkerPool::new(4);
		let fiber = PoolFiber::new(pool.clone(), reactor.handle().clone());

		let seen = Arc::new(Mutex::new(Vec::new()));
		for i in 0..500u32 {
			let seen = seen.clone();
			fiber.execute(move || seen.lock().unwrap().push(i)).unwrap();
		}

		busy_wait(|| (seen.lock().unwrap().len() == 500).then_some(()));
		assert_eq!(*seen.lock().unwrap(), (0..500).collect::<Vec<_>>());
		pool.shutdown();
		reactor.dispose();
	}

	#[test]
	fn test_fibers_serialize_but_pool_is_shared() {
		let reactor = Reactor::spawn("test-reactor").unwrap();
		let pool = WorkerPool::new(4);
		let a = PoolFiber::new(pool.clone(), reactor.handle().clone());
		let b = PoolFiber::new(pool.clone(), reactor.handle().clone());

		// a slow task on one fiber must not delay the other fiber forever,
		// and tasks within a fiber never overlap
		let running = Arc::new(AtomicU32::new(0));
		let overlapped = Arc::new(AtomicBool::new(false));
		let done = Arc::new(AtomicU32::new(0));

		for fiber in [&a, &b] {
			for _ in 0..50 {
				let running = running.clone();
				let overlapped = overlapped.clone();
				let done = done.clone();
				fiber.execute(move || {
					if running.fetch_add(1, Ordering::SeqCst) >= 2 {
						overlapped.store(true, Ordering::SeqCst);
					}
					std::thread::sleep(Duration::from_micros(200));
					running.fetch_sub(1, Ordering::SeqCst);
					done.fetch_add(1, Ordering::SeqCst);
				})
				.unwrap();
			}
		}

		busy_wait(|| (done.load(Ordering::SeqCst) == 100).then_some(()));
		assert!(!overlapped.load(Ordering::SeqCst));
		pool.shutdown();
		reactor.dispose();
	}

	#[test]
	fn test_execute_rejected_after_pool_shutdown() {
		let reactor = Reactor::spawn("test-reactor").unwrap();
		let pool = WorkerPool::new(1);
		let fiber = PoolFiber::new(pool.clone(), reactor.handle().clone());
		pool.shutdown();

		let result = fiber.execute(|| {});
		assert!(matches!(result, Err(CoreError::ExecutorRejected)));
		reactor.dispose();
	}

	#[test]
	fn test_fixed_delay_runs_on_fiber() {
		let reactor = Reactor::spawn("test-reactor").unwrap();
		let pool = WorkerPool::new(2);
		let fiber = PoolFiber::new(pool.clone(), reactor.handle().clone());

		let count = Arc::new(AtomicU32::new(0));
		let counter = count.clone();
		let handle = fiber.schedule_with_fixed_delay(
			Duration::from_millis(5),
			Duration::from_millis(5),
			move || {
				counter.fetch_add(1, Ordering::SeqCst);
			},
		);

		busy_wait(|| (count.load(Ordering::SeqCst) >= 3).then_some(()));
		handle.cancel();
		pool.shutdown();
		reactor.dispose();
	}
}
