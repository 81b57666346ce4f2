// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Per-connection reactor handler on the accepting side.
//!
//! States: Handshaking until the upgrade completes, Open while frames flow,
//! Closing while the close handshake drains, Closed after teardown. Handler
//! callbacks never run here; they are posted to the session's pool fiber in
//! arrival order, so `on_error` always precedes the final `on_close`.

use std::{
	io,
	net::SocketAddr,
	os::fd::AsRawFd,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
	time::Instant,
};

use mio::{net::TcpStream, unix::SourceFd, Interest, Registry, Token};
use weft_core::{PoolFiber, ReactorHandle, SelectCx, SelectHandler, TimerHandle, WorkerPool};
use weft_network::{
	ws::{
		accept_key, build_accept_response, build_reject_response, close_code,
		encode_frame, parse_upgrade_request, Frame, FrameError, FrameParser,
		MessageAssembler, UpgradeRequest, WsEvent,
	},
	DrainState, NetworkError, ReadBuffer, SendResult, Writer,
};

use crate::{config::ServerConfig, handler::SessionHandler, session::StreamSession};

enum ConnState {
	Handshaking,
	Open(OpenSession),
	Closing(Option<OpenSession>),
	Closed,
}

struct OpenSession {
	session: Arc<StreamSession>,
	handler: Arc<Mutex<Box<dyn SessionHandler>>>,
	fiber: PoolFiber,
}

impl OpenSession {
	/// Post a handler callback onto the session fiber.
	fn dispatch(
		&self,
		callback: impl FnOnce(&mut dyn SessionHandler, &Arc<StreamSession>) + Send + 'static,
	) {
		let handler = self.handler.clone();
		let session = self.session.clone();
		let posted = self.fiber.execute(move || {
			let mut guard = handler.lock().unwrap();
			callback(guard.as_mut(), &session);
		});
		if posted.is_err() {
			tracing::debug!("session fiber rejected callback, pool shutting down");
		}
	}
}

pub(crate) struct ServerConnection {
	stream: Arc<TcpStream>,
	peer: SocketAddr,
	reactor: ReactorHandle,
	pool: WorkerPool,
	config: ServerConfig,
	session_seq: Arc<AtomicU64>,
	read_buf: ReadBuffer,
	parser: FrameParser,
	assembler: MessageAssembler,
	writer: Writer,
	state: ConnState,
	last_read: Arc<Mutex<Instant>>,
	idle_timer: Option<TimerHandle>,
	ended: bool,
}

impl ServerConnection {
	pub(crate) fn new(
		stream: TcpStream,
		peer: SocketAddr,
		reactor: ReactorHandle,
		pool: WorkerPool,
		config: ServerConfig,
		session_seq: Arc<AtomicU64>,
	) -> Self {
		let stream = Arc::new(stream);
		let writer = Writer::new(stream.clone(), reactor.clone(), config.high_water_mark);
		Self {
			stream,
			peer,
			reactor,
			pool,
			read_buf: ReadBuffer::new(config.read_buffer_size, config.read_buffer_max),
			parser: FrameParser::new(true, config.max_frame_size),
			assembler: MessageAssembler::new(config.max_frame_size),
			writer,
			config,
			session_seq,
			state: ConnState::Handshaking,
			last_read: Arc::new(Mutex::new(Instant::now())),
			idle_timer: None,
			ended: false,
		}
	}

	fn process(&mut self) -> bool {
		loop {
			match &self.state {
				ConnState::Handshaking => match self.process_handshake() {
					Some(true) => continue,
					Some(false) => return false,
					None => return true,
				},
				ConnState::Open(_) => return self.process_frames(),
				ConnState::Closing(_) | ConnState::Closed => {
					// draining only; discard whatever the peer sends
					let len = self.read_buf.len();
					self.read_buf.consume(len);
					return true;
				}
			}
		}
	}

	/// `Some(true)` = upgraded, keep processing; `Some(false)` = reject and
	/// close; `None` = need more bytes.
	fn process_handshake(&mut self) -> Option<bool> {
		match parse_upgrade_request(self.read_buf.data()) {
			Ok(None) => None,
			Ok(Some((request, consumed))) => {
				self.read_buf.consume(consumed);
				Some(self.complete_handshake(request))
			}
			Err(error) => {
				tracing::debug!(peer = %self.peer, %error, "rejecting upgrade");
				let _ = self.writer.send(build_reject_response(400, "Bad Request"));
				Some(false)
			}
		}
	}

	fn complete_handshake(&mut self, request: UpgradeRequest) -> bool {
		let Some(factory) = self.config.route(&request.path) else {
			tracing::debug!(peer = %self.peer, path = %request.path, "no route for upgrade path");
			let _ = self.writer.send(build_reject_response(404, "Not Found"));
			return false;
		};

		if let Some(auth) = self.config.auth_predicate() {
			if !(**auth)(&request) {
				tracing::debug!(peer = %self.peer, "upgrade rejected by auth predicate");
				let _ = self.writer.send(build_reject_response(401, "Unauthorized"));
				return false;
			}
		}

		let accept = accept_key(&request.key);
		if self.writer.send(build_accept_response(&accept)) == SendResult::Closed {
			return false;
		}

		let id = self.session_seq.fetch_add(1, Ordering::Relaxed);
		let fiber = PoolFiber::new(self.pool.clone(), self.reactor.clone());
		let session = StreamSession::new(
			id,
			self.peer,
			self.writer.clone(),
			fiber.clone(),
			self.config.errors(),
		);
		session.start_heartbeat(self.config.heartbeat_interval);

		let open = OpenSession {
			session,
			handler: Arc::new(Mutex::new(factory.create())),
			fiber,
		};
		open.dispatch(move |handler, session| handler.on_open(session, &request));
		tracing::debug!(peer = %self.peer, session = id, "upgrade complete");
		self.state = ConnState::Open(open);
		true
	}

	fn process_frames(&mut self) -> bool {
		loop {
			match self.parser.parse(self.read_buf.data()) {
				Ok(None) => return true,
				Ok(Some((frame, consumed))) => {
					self.read_buf.consume(consumed);
					match self.assembler.push(frame) {
						Ok(None) => {}
						Ok(Some(event)) => {
							if !self.handle_event(event) {
								return false;
							}
						}
						Err(error) => {
							self.protocol_error(error);
							return false;
						}
					}
				}
				Err(error) => {
					self.protocol_error(error);
					return false;
				}
			}
		}
	}

	fn handle_event(&mut self, event: WsEvent) -> bool {
		match event {
			WsEvent::Text(text) => {
				if let ConnState::Open(open) = &self.state {
					open.dispatch(move |handler, session| {
						handler.on_message(session, &text)
					});
				}
				true
			}
			WsEvent::Binary(data) => {
				if let ConnState::Open(open) = &self.state {
					open.dispatch(move |handler, session| {
						handler.on_binary_message(session, &data)
					});
				}
				true
			}
			WsEvent::Ping(payload) => {
				// pongs ride the priority lane, ahead of pending data
				let pong = encode_frame(&Frame::pong(payload), None);
				self.writer.send_priority(pong) != SendResult::Closed
			}
			WsEvent::Pong(_) => true,
			WsEvent::Close { code, .. } => self.peer_close(code),
		}
	}

	/// Peer-initiated close: echo the code when well-formed, drain, close.
	fn peer_close(&mut self, code: Option<u16>) -> bool {
		let echo = Frame::close(code.unwrap_or(close_code::NORMAL), "");
		match self.writer.send_close(encode_frame(&echo, None)) {
			SendResult::Sent | SendResult::Closed => false,
			SendResult::Buffered(_) => {
				if let ConnState::Open(open) =
					std::mem::replace(&mut self.state, ConnState::Closed)
				{
					self.state = ConnState::Closing(Some(open));
				} else {
					self.state = ConnState::Closing(None);
				}
				true
			}
		}
	}

	fn protocol_error(&mut self, error: FrameError) {
		tracing::debug!(peer = %self.peer, %error, code = error.close_code(), "protocol violation");
		let close = Frame::close(error.close_code(), &error.to_string());
		let _ = self.writer.send_close(encode_frame(&close, None));
		if let ConnState::Open(open) = &self.state {
			let reason = error.to_string();
			open.dispatch(move |handler, session| handler.on_error(session, &reason));
		}
	}

	fn transport_error(&mut self, error: io::Error) {
		tracing::debug!(peer = %self.peer, %error, "transport error");
		if let ConnState::Open(open) = &self.state {
			let error = NetworkError::Io(error);
			open.dispatch(move |handler, session| handler.on_exception(session, &error));
		}
	}

	fn teardown(&mut self) {
		if self.ended {
			return;
		}
		self.ended = true;

		if let Some(timer) = self.idle_timer.take() {
			timer.cancel();
		}

		let state = std::mem::replace(&mut self.state, ConnState::Closed);
		let open = match state {
			ConnState::Open(open) => Some(open),
			ConnState::Closing(open) => open,
			_ => None,
		};
		if let Some(open) = open {
			open.session.stop_heartbeat();
			open.dispatch(|handler, session| handler.on_close(session));
		}

		self.writer.mark_closed();
	}
}

impl SelectHandler for ServerConnection {
	fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
		let fd = self.stream.as_raw_fd();
		registry.register(&mut SourceFd(&fd), token, Interest::READABLE)?;
		self.writer.bind(token);

		if !self.config.read_timeout.is_zero() {
			let timeout = self.config.read_timeout;
			let last_read = self.last_read.clone();
			let stream = self.stream.clone();
			let peer = self.peer;
			self.idle_timer = Some(self.reactor.schedule_with_fixed_delay(
				timeout,
				timeout,
				move || {
					if last_read.lock().unwrap().elapsed() > timeout {
						tracing::debug!(%peer, "idle read timeout, closing connection");
						let _ = stream.shutdown(std::net::Shutdown::Both);
					}
				},
			));
		}
		Ok(())
	}

	fn deregister(&mut self, registry: &Registry) {
		let fd = self.stream.as_raw_fd();
		let _ = registry.deregister(&mut SourceFd(&fd));
	}

	fn on_select(&mut self, cx: &mut SelectCx<'_>) -> bool {
		if cx.writable {
			match self.writer.on_writable(cx.registry) {
				DrainState::Closed => return false,
				// FinishedClose: write side is shut; wait for the peer's FIN
				DrainState::FinishedClose | DrainState::Idle | DrainState::Pending => {}
			}
		}

		if cx.readable {
			let outcome = match self.read_buf.fill(&self.stream, self.config.max_read_loops) {
				Ok(outcome) => outcome,
				Err(error) => {
					self.transport_error(error);
					return false;
				}
			};
			if outcome.bytes > 0 {
				*self.last_read.lock().unwrap() = Instant::now();
			}
			if !self.process() {
				return false;
			}
			if outcome.overflow {
				self.protocol_error(FrameError::PayloadTooLarge(self.read_buf.len()));
				return false;
			}
			if outcome.eof {
				return false;
			}
			if outcome.exhausted {
				// loop limit, not WouldBlock: re-arm so the edge fires again
				let interest = if self.writer.is_pending() {
					Interest::READABLE | Interest::WRITABLE
				} else {
					Interest::READABLE
				};
				let fd = self.stream.as_raw_fd();
				let _ = cx.registry.reregister(&mut SourceFd(&fd), cx.token, interest);
			}
		}

		true
	}

	fn on_end(&mut self) {
		self.teardown();
	}
}
