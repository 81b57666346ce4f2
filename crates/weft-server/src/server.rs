// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Convenience runtime: spawns the acceptor reactor, the reader reactors,
//! and the shared worker pool, then starts an [`Acceptor`] over them.

use std::{io, net::SocketAddr};

use weft_core::{Reactor, WorkerPool};

use crate::{
	acceptor::{Acceptor, ReaderPool},
	config::ServerConfig,
};

pub struct Server {
	acceptor_reactor: Option<Reactor>,
	readers: Vec<Reactor>,
	pool: WorkerPool,
	addr: SocketAddr,
}

impl Server {
	pub fn start(port: u16, config: ServerConfig) -> io::Result<Self> {
		let pool = WorkerPool::new(config.worker_count);
		let acceptor_reactor = Reactor::spawn("weft-acceptor")?;

		let mut readers = Vec::new();
		for i in 0..config.reader_count.max(1) {
			let reactor = Reactor::spawn(&format!("weft-reader-{i}"))?;
			if config.pin_threads {
				reactor.handle().execute(move || {
					if let Some(core) = core_affinity::get_core_ids()
						.and_then(|cores| cores.get(i).cloned())
					{
						core_affinity::set_for_current(core);
					}
				});
			}
			readers.push(reactor);
		}

		let handles = readers.iter().map(|r| r.handle().clone()).collect();
		let addr = Acceptor::new(
			port,
			acceptor_reactor.handle().clone(),
			ReaderPool::new(handles),
			pool.clone(),
			config,
			|| tracing::debug!("acceptor ended"),
		)
		.start()?;

		Ok(Self {
			acceptor_reactor: Some(acceptor_reactor),
			readers,
			pool,
			addr,
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.addr
	}

	/// Stop accepting, tear down the reactors, and join the worker pool.
	pub fn stop(mut self) {
		if let Some(acceptor) = self.acceptor_reactor.take() {
			acceptor.dispose();
		}
		for reader in self.readers.drain(..) {
			reader.dispose();
		}
		self.pool.shutdown();
	}
}
