// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

use std::{sync::Arc, time::Duration};

use weft_network::ws::UpgradeRequest;

use crate::handler::{ErrorHandler, LoggingErrorHandler, SessionHandlerFactory};

type PathPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type AuthPredicate = Arc<dyn Fn(&UpgradeRequest) -> bool + Send + Sync>;

#[derive(Clone)]
struct Route {
	matches: PathPredicate,
	factory: Arc<dyn SessionHandlerFactory>,
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
	/// Initial per-connection read buffer capacity.
	pub read_buffer_size: usize,

	/// Hard ceiling for the per-connection read buffer.
	pub read_buffer_max: usize,

	/// Maximum read passes per selector wake-up.
	pub max_read_loops: usize,

	/// Interval between heartbeat pings; zero disables.
	pub heartbeat_interval: Duration,

	/// Close the session when no bytes arrive for this long; zero disables.
	pub read_timeout: Duration,

	/// Writer soft limit; exceeding it closes the connection.
	pub high_water_mark: usize,

	/// Maximum frame (and reassembled message) payload size.
	pub max_frame_size: usize,

	/// Threads in the shared handler worker pool.
	pub worker_count: usize,

	/// Reader reactors accepting connections round-robin.
	pub reader_count: usize,

	/// Pin reader threads to cores.
	pub pin_threads: bool,

	routes: Vec<Route>,
	auth: Option<AuthPredicate>,
	errors: Arc<dyn ErrorHandler>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			read_buffer_size: 8 * 1024,
			read_buffer_max: (16 << 20) + 1024,
			max_read_loops: 50,
			heartbeat_interval: Duration::from_secs(30),
			read_timeout: Duration::ZERO,
			high_water_mark: 1 << 20,
			max_frame_size: 16 << 20,
			worker_count: 2,
			reader_count: 1,
			pin_threads: false,
			routes: Vec::new(),
			auth: None,
			errors: Arc::new(LoggingErrorHandler),
		}
	}
}

impl ServerConfig {
	pub fn new() -> Self {
		Self::default()
	}

	/// Route upgrades whose path matches `predicate` to `factory`.
	pub fn add(
		mut self,
		predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
		factory: Arc<dyn SessionHandlerFactory>,
	) -> Self {
		self.routes.push(Route {
			matches: Arc::new(predicate),
			factory,
		});
		self
	}

	/// Pluggable authentication predicate, consulted before the upgrade is
	/// answered. Rejection yields a `401`.
	pub fn auth(mut self, predicate: impl Fn(&UpgradeRequest) -> bool + Send + Sync + 'static) -> Self {
		self.auth = Some(Arc::new(predicate));
		self
	}

	pub fn error_handler(mut self, errors: Arc<dyn ErrorHandler>) -> Self {
		self.errors = errors;
		self
	}

	pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
		self.heartbeat_interval = interval;
		self
	}

	pub fn read_timeout(mut self, timeout: Duration) -> Self {
		self.read_timeout = timeout;
		self
	}

	pub fn high_water_mark(mut self, limit: usize) -> Self {
		self.high_water_mark = limit;
		self
	}

	pub fn max_frame_size(mut self, limit: usize) -> Self {
		self.max_frame_size = limit;
		self
	}

	pub fn worker_count(mut self, count: usize) -> Self {
		self.worker_count = count;
		self
	}

	pub fn reader_count(mut self, count: usize) -> Self {
		self.reader_count = count;
		self
	}

	pub(crate) fn route(&self, path: &str) -> Option<Arc<dyn SessionHandlerFactory>> {
		self.routes
			.iter()
			.find(|route| (*route.matches)(path))
			.map(|route| route.factory.clone())
	}

	pub(crate) fn auth_predicate(&self) -> Option<&AuthPredicate> {
		self.auth.as_ref()
	}

	pub(crate) fn errors(&self) -> Arc<dyn ErrorHandler> {
		self.errors.clone()
	}
}

/// Exact-path route predicate.
pub fn path_eq(expected: impl Into<String>) -> impl Fn(&str) -> bool + Send + Sync {
	let expected = expected.into();
	move |path: &str| path == expected
}
