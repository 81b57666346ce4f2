// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Initial read buffer capacity.
	pub read_buffer_size: usize,

	/// Hard ceiling for the read buffer.
	pub read_buffer_max: usize,

	/// Maximum read passes per selector wake-up.
	pub max_read_loops: usize,

	/// Connect-attempt deadline; doubles as the reconnect delay. Zero
	/// disables both the deadline and reconnects.
	pub connect_timeout: Duration,

	/// Interval between heartbeat pings; zero disables.
	pub heartbeat_interval: Duration,

	/// Close the session when no bytes arrive for this long; zero disables.
	pub read_timeout: Duration,

	/// Writer soft limit; exceeding it closes the connection.
	pub high_water_mark: usize,

	/// Maximum frame (and reassembled message) payload size.
	pub max_frame_size: usize,

	/// Reconnect after a close or failed connect, until `stop()`.
	pub reconnect: bool,

	/// Seed for the masking RNG; `None` seeds from the OS. Tests pin this
	/// for reproducible wire bytes.
	pub mask_seed: Option<u64>,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			read_buffer_size: 1024,
			read_buffer_max: (16 << 20) + 1024,
			max_read_loops: 50,
			connect_timeout: Duration::from_secs(5),
			heartbeat_interval: Duration::ZERO,
			read_timeout: Duration::ZERO,
			high_water_mark: 1 << 20,
			max_frame_size: 16 << 20,
			reconnect: true,
			mask_seed: None,
		}
	}
}

impl ClientConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;
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

	pub fn reconnect(mut self, reconnect: bool) -> Self {
		self.reconnect = reconnect;
		self
	}

	pub fn mask_seed(mut self, seed: u64) -> Self {
		self.mask_seed = Some(seed);
		self
	}
}
