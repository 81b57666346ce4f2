// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! The acceptor: a reactor handler bound to the listening socket.
//!
//! Accepted connections are handed round-robin to the reader reactors, each
//! wired with a connection handler that starts in the handshake state.

use std::{
	io,
	sync::{
		atomic::{AtomicU64, AtomicUsize, Ordering},
		Arc,
	},
};

use mio::{net::TcpListener, Interest, Registry, Token};
use weft_core::{ReactorHandle, SelectCx, SelectHandler, WorkerPool};

use crate::{config::ServerConfig, connection::ServerConnection};

/// Round-robin distributor over the reader reactors.
pub struct ReaderPool {
	handles: Vec<ReactorHandle>,
	next: AtomicUsize,
}

impl ReaderPool {
	/// `handles` must not be empty.
	pub fn new(handles: Vec<ReactorHandle>) -> Self {
		assert!(!handles.is_empty(), "reader pool needs at least one reactor");
		Self {
			handles,
			next: AtomicUsize::new(0),
		}
	}

	fn next_handle(&self) -> &ReactorHandle {
		let index = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
		&self.handles[index]
	}
}

pub struct Acceptor {
	port: u16,
	reactor: ReactorHandle,
	readers: Arc<ReaderPool>,
	pool: WorkerPool,
	config: ServerConfig,
	on_end: Option<Box<dyn FnOnce() + Send>>,
}

impl Acceptor {
	pub fn new(
		port: u16,
		reactor: ReactorHandle,
		readers: ReaderPool,
		pool: WorkerPool,
		config: ServerConfig,
		on_end: impl FnOnce() + Send + 'static,
	) -> Self {
		Self {
			port,
			reactor,
			readers: Arc::new(readers),
			pool,
			config,
			on_end: Some(Box::new(on_end)),
		}
	}

	/// Bind and start accepting. Returns the bound address (useful with
	/// port 0).
	pub fn start(mut self) -> io::Result<std::net::SocketAddr> {
		let std_listener = std::net::TcpListener::bind(("0.0.0.0", self.port))?;
		std_listener.set_nonblocking(true)?;
		let addr = std_listener.local_addr()?;
		let listener = TcpListener::from_std(std_listener);

		tracing::debug!(%addr, "acceptor listening");
		self.reactor.add_handler(AcceptorHandler {
			listener,
			readers: self.readers.clone(),
			pool: self.pool.clone(),
			config: self.config.clone(),
			session_seq: Arc::new(AtomicU64::new(1)),
			on_end: self.on_end.take(),
		});
		Ok(addr)
	}
}

struct AcceptorHandler {
	listener: TcpListener,
	readers: Arc<ReaderPool>,
	pool: WorkerPool,
	config: ServerConfig,
	session_seq: Arc<AtomicU64>,
	on_end: Option<Box<dyn FnOnce() + Send>>,
}

impl SelectHandler for AcceptorHandler {
	fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
		registry.register(&mut self.listener, token, Interest::READABLE)
	}

	fn deregister(&mut self, registry: &Registry) {
		let _ = registry.deregister(&mut self.listener);
	}

	fn on_select(&mut self, _cx: &mut SelectCx<'_>) -> bool {
		loop {
			match self.listener.accept() {
				Ok((stream, peer)) => {
					if let Err(error) = stream.set_nodelay(true) {
						tracing::debug!(%peer, %error, "set_nodelay failed");
					}
					let reader = self.readers.next_handle();
					let connection = ServerConnection::new(
						stream,
						peer,
						reader.clone(),
						self.pool.clone(),
						self.config.clone(),
						self.session_seq.clone(),
					);
					reader.add_handler(connection);
					tracing::debug!(%peer, "accepted connection");
				}
				Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
				Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
				Err(error) => {
					tracing::error!(%error, "accept failed");
					break;
				}
			}
		}
		true
	}

	fn on_end(&mut self) {
		if let Some(on_end) = self.on_end.take() {
			on_end();
		}
	}
}
