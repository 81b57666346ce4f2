// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! The selector reactor: one thread owns a `mio::Poll` and everything
//! registered on it.
//!
//! Each loop iteration polls with a timeout derived from the nearest timer
//! deadline, dispatches ready handlers, fires due timers (deadline order,
//! insertion order on ties), and then drains the task queue fully. External
//! threads interact only through [`ReactorHandle`], which enqueues a task and
//! wakes the poll.

use std::{
	cmp::Ordering as CmpOrdering,
	collections::BinaryHeap,
	io,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread,
	time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::{Events, Poll, Registry, Token, Waker};
use slab::Slab;

/// Token reserved for the wake-up channel.
const WAKE: Token = Token(0);
/// Handler tokens are slab keys offset past the reserved range.
const TOKEN_BASE: usize = 1;

const EVENTS_CAPACITY: usize = 1024;

type Task = Box<dyn FnOnce(&mut ReactorCore) + Send>;
type TimerTask = Box<dyn FnMut() + Send>;

/// A channel handler bound to a reactor.
///
/// All four callbacks run on the reactor thread. `register`/`deregister`
/// bracket the handler's poll registration; `on_select` is the readiness
/// notification and its return value decides whether the handler stays
/// registered; `on_end` runs exactly once, when the handler is removed or the
/// reactor shuts down, and is where the handler releases its socket.
pub trait SelectHandler: Send {
	fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;

	fn deregister(&mut self, registry: &Registry);

	/// Returns `true` to keep the handler registered, `false` to remove it.
	fn on_select(&mut self, cx: &mut SelectCx<'_>) -> bool;

	fn on_end(&mut self);
}

/// Readiness context handed to [`SelectHandler::on_select`].
pub struct SelectCx<'a> {
	pub registry: &'a Registry,
	pub token: Token,
	pub readable: bool,
	pub writable: bool,
	pub handle: &'a ReactorHandle,
}

/// Cancel handle for a scheduled timer. Cancellation is idempotent and is a
/// no-op after the timer fired or the reactor shut down.
#[derive(Clone)]
pub struct TimerHandle {
	cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
	fn new() -> (Self, Arc<AtomicBool>) {
		let cancelled = Arc::new(AtomicBool::new(false));
		(
			Self {
				cancelled: cancelled.clone(),
			},
			cancelled,
		)
	}

	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::Release);
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::Acquire)
	}
}

struct TimerEntry {
	deadline: Instant,
	seq: u64,
	period: Option<Duration>,
	cancelled: Arc<AtomicBool>,
	task: TimerTask,
}

impl PartialEq for TimerEntry {
	fn eq(&self, other: &Self) -> bool {
		self.deadline == other.deadline && self.seq == other.seq
	}
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}

impl Ord for TimerEntry {
	fn cmp(&self, other: &Self) -> CmpOrdering {
		// BinaryHeap is a max-heap; reverse so the earliest deadline
		// pops first, ties broken by insertion sequence.
		other.deadline
			.cmp(&self.deadline)
			.then_with(|| other.seq.cmp(&self.seq))
	}
}

/// Cloneable handle for posting work onto a reactor from any thread.
#[derive(Clone)]
pub struct ReactorHandle {
	tx: Sender<Task>,
	waker: Arc<Waker>,
	shutdown: Arc<AtomicBool>,
}

impl ReactorHandle {
	/// Enqueue a task for the reactor thread. Tasks posted before others run
	/// before them; tasks enqueued after shutdown are dropped silently.
	pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
		self.submit(move |_core| task());
	}

	/// Enqueue a task that receives the reactor internals. This is how
	/// cross-thread producers re-arm write interest or install handlers
	/// without touching reactor state directly.
	pub fn submit(&self, task: impl FnOnce(&mut ReactorCore) + Send + 'static) {
		if self.shutdown.load(Ordering::Acquire) {
			return;
		}
		if self.tx.send(Box::new(task)).is_ok() {
			let _ = self.waker.wake();
		}
	}

	/// Install a channel handler on the reactor.
	pub fn add_handler(&self, handler: impl SelectHandler + 'static) {
		self.submit(move |core| core.install(Box::new(handler)));
	}

	/// Run `task` once after `delay`.
	pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
		let (handle, cancelled) = TimerHandle::new();
		let mut task = Some(task);
		self.submit(move |core| {
			core.install_timer(
				delay,
				None,
				cancelled,
				Box::new(move || {
					if let Some(task) = task.take() {
						task();
					}
				}),
			);
		});
		handle
	}

	/// Run `task` after `initial`, then repeatedly `period` after each
	/// completion (fixed delay, not fixed rate).
	pub fn schedule_with_fixed_delay(
		&self,
		initial: Duration,
		period: Duration,
		task: impl FnMut() + Send + 'static,
	) -> TimerHandle {
		let (handle, cancelled) = TimerHandle::new();
		self.submit(move |core| {
			core.install_timer(initial, Some(period), cancelled, Box::new(task));
		});
		handle
	}

	pub fn is_shutdown(&self) -> bool {
		self.shutdown.load(Ordering::Acquire)
	}
}

/// Reactor internals, visible only to tasks running on the reactor thread.
pub struct ReactorCore {
	poll: Poll,
	handlers: Slab<Option<Box<dyn SelectHandler>>>,
	timers: BinaryHeap<TimerEntry>,
	timer_seq: u64,
	tasks: Receiver<Task>,
	handle: ReactorHandle,
}

impl ReactorCore {
	pub fn registry(&self) -> &Registry {
		self.poll.registry()
	}

	pub fn handle(&self) -> &ReactorHandle {
		&self.handle
	}

	fn install(&mut self, mut handler: Box<dyn SelectHandler>) {
		let entry = self.handlers.vacant_entry();
		let token = Token(TOKEN_BASE + entry.key());
		match handler.register(self.poll.registry(), token) {
			Ok(()) => {
				entry.insert(Some(handler));
			}
			Err(error) => {
				tracing::warn!(%error, "handler registration failed");
				handler.on_end();
			}
		}
	}

	fn install_timer(
		&mut self,
		delay: Duration,
		period: Option<Duration>,
		cancelled: Arc<AtomicBool>,
		task: TimerTask,
	) {
		let seq = self.timer_seq;
		self.timer_seq += 1;
		self.timers.push(TimerEntry {
			deadline: Instant::now() + delay,
			seq,
			period,
			cancelled,
			task,
		});
	}

	fn remove_handler(&mut self, key: usize) {
		if let Some(Some(mut handler)) = self.handlers.try_remove(key) {
			handler.deregister(self.poll.registry());
			handler.on_end();
		}
	}

	fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
		let Some(key) = token.0.checked_sub(TOKEN_BASE) else {
			return;
		};
		let handler = match self.handlers.get_mut(key) {
			Some(slot) => slot.take(),
			None => return,
		};
		let Some(mut handler) = handler else {
			return;
		};

		let handle = self.handle.clone();
		let keep = {
			let mut cx = SelectCx {
				registry: self.poll.registry(),
				token,
				readable,
				writable,
				handle: &handle,
			};
			handler.on_select(&mut cx)
		};

		if keep {
			if let Some(slot) = self.handlers.get_mut(key) {
				*slot = Some(handler);
			}
		} else {
			handler.deregister(self.poll.registry());
			handler.on_end();
			self.handlers.try_remove(key);
		}
	}

	fn next_timeout(&self) -> Option<Duration> {
		self.timers
			.peek()
			.map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
	}

	fn fire_timers(&mut self) {
		let now = Instant::now();
		while let Some(top) = self.timers.peek() {
			if top.deadline > now {
				break;
			}
			let Some(mut entry) = self.timers.pop() else {
				break;
			};
			if entry.cancelled.load(Ordering::Acquire) {
				continue;
			}
			(entry.task)();
			if let Some(period) = entry.period {
				if !entry.cancelled.load(Ordering::Acquire) {
					entry.deadline = Instant::now() + period;
					entry.seq = self.timer_seq;
					self.timer_seq += 1;
					self.timers.push(entry);
				}
			}
		}
	}

	fn drain_tasks(&mut self) {
		while let Ok(task) = self.tasks.try_recv() {
			task(self);
		}
	}

	fn run(&mut self) {
		let mut events = Events::with_capacity(EVENTS_CAPACITY);
		tracing::debug!("reactor thread starting");

		loop {
			if self.handle.shutdown.load(Ordering::Acquire) {
				break;
			}

			if let Err(error) = self.poll.poll(&mut events, self.next_timeout()) {
				if error.kind() == io::ErrorKind::Interrupted {
					continue;
				}
				tracing::error!(%error, "poll failed, stopping reactor");
				break;
			}

			for event in events.iter() {
				match event.token() {
					WAKE => {}
					token => self.dispatch(
						token,
						event.is_readable()
							|| event.is_read_closed() || event.is_error(),
						event.is_writable() || event.is_write_closed(),
					),
				}
			}

			self.fire_timers();
			self.drain_tasks();
		}

		self.finish();
	}

	fn finish(&mut self) {
		let keys: Vec<usize> = self.handlers.iter().map(|(key, _)| key).collect();
		for key in keys {
			self.remove_handler(key);
		}
		self.timers.clear();
		while self.tasks.try_recv().is_ok() {}
		tracing::debug!("reactor thread stopped");
	}
}

/// A running reactor. Dropping (or calling [`Reactor::dispose`]) shuts the
/// loop down, runs `on_end` for every registered handler, discards pending
/// timers, and joins the thread.
pub struct Reactor {
	handle: ReactorHandle,
	thread: Option<thread::JoinHandle<()>>,
}

impl Reactor {
	pub fn spawn(name: &str) -> io::Result<Self> {
		let poll = Poll::new()?;
		let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
		let (tx, rx) = unbounded();
		let handle = ReactorHandle {
			tx,
			waker,
			shutdown: Arc::new(AtomicBool::new(false)),
		};

		let mut core = ReactorCore {
			poll,
			handlers: Slab::new(),
			timers: BinaryHeap::new(),
			timer_seq: 0,
			tasks: rx,
			handle: handle.clone(),
		};

		let thread = thread::Builder::new()
			.name(name.to_string())
			.spawn(move || core.run())?;

		Ok(Self {
			handle,
			thread: Some(thread),
		})
	}

	pub fn handle(&self) -> &ReactorHandle {
		&self.handle
	}

	/// Shut the reactor down and join its thread.
	pub fn dispose(mut self) {
		self.shutdown_and_join();
	}

	fn shutdown_and_join(&mut self) {
		if !self.handle.shutdown.swap(true, Ordering::AcqRel) {
			let _ = self.handle.waker.wake();
		}
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

impl Drop for Reactor {
	fn drop(&mut self) {
		self.shutdown_and_join();
	}
}
