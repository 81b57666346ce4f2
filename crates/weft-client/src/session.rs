// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! The client session state machine.
//!
//! One tagged variant holds the whole lifecycle: NotConnected →
//! AwaitingConnect → Handshaking → Open → Closing → Closed, with every
//! transition in this file. Handler callbacks run on the session's pool
//! fiber in posting order; `on_close` fires exactly once per opened session.
//! Reconnects are latched off by `stop()` on the reactor thread, so a
//! pending reconnect never fires afterwards.

use std::{
	io,
	net::ToSocketAddrs,
	os::fd::AsRawFd,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Mutex, Weak,
	},
	time::Instant,
};

use mio::{net::TcpStream, unix::SourceFd, Interest, Registry, Token};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use weft_core::{PoolFiber, ReactorHandle, SelectCx, SelectHandler, TimerHandle, WorkerPool};
use weft_network::{
	ws::{
		build_upgrade_request, close_code, encode_frame, generate_key,
		parse_upgrade_response, Frame, FrameError, FrameParser, MessageAssembler,
		UpgradeResponse, WsEvent,
	},
	DrainState, NetworkError, ReadBuffer, SendResult, Writer,
};

use crate::config::ClientConfig;

/// Per-session callbacks, serialized on the session fiber.
///
/// `on_open` produces the session state threaded through the remaining
/// callbacks. `on_error`/`on_exception` may fire before the session opened,
/// so they see `Option<&mut State>`.
pub trait ClientHandler: Send + 'static {
	type State: Send + 'static;

	fn on_open(&mut self, conn: &ClientHandle, response: &UpgradeResponse) -> Self::State;

	fn on_message(&mut self, _conn: &ClientHandle, _state: &mut Self::State, _text: &str) {}

	fn on_binary_message(
		&mut self,
		_conn: &ClientHandle,
		_state: &mut Self::State,
		_data: &[u8],
	) {
	}

	fn on_error(&mut self, _conn: &ClientHandle, _state: Option<&mut Self::State>, _reason: &str) {
	}

	fn on_exception(
		&mut self,
		_conn: &ClientHandle,
		_state: Option<&mut Self::State>,
		_error: &NetworkError,
	) {
	}

	fn on_close(&mut self, _conn: &ClientHandle, _state: &mut Self::State) {}
}

/// The session facade handed to callbacks; cheap to clone, safe to keep.
#[derive(Clone)]
pub struct ClientHandle {
	shared: Weak<ClientShared>,
}

impl ClientHandle {
	pub fn send(&self, text: &str) -> SendResult {
		match self.shared.upgrade() {
			Some(shared) => shared.send_frame(Frame::text(text)),
			None => SendResult::Closed,
		}
	}

	pub fn send_binary(&self, data: &[u8]) -> SendResult {
		match self.shared.upgrade() {
			Some(shared) => shared.send_frame(Frame::binary(data.to_vec())),
			None => SendResult::Closed,
		}
	}

	pub fn send_close(&self) -> SendResult {
		match self.shared.upgrade() {
			Some(shared) => shared.send_close(),
			None => SendResult::Closed,
		}
	}

	pub fn stop(&self) {
		if let Some(shared) = self.shared.upgrade() {
			shared.stop();
		}
	}
}

/// A WebSocket client session over a reactor.
pub struct WsClient {
	shared: Arc<ClientShared>,
}

impl WsClient {
	/// Connect to `ws://host:port{path}` and start the session. The handler's
	/// callbacks begin with `on_open` once the upgrade completes.
	pub fn open<H: ClientHandler>(
		reactor: &ReactorHandle,
		pool: &WorkerPool,
		host: impl Into<String>,
		port: u16,
		path: impl Into<String>,
		config: ClientConfig,
		handler: H,
	) -> Self {
		let rng = match config.mask_seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_entropy(),
		};

		let shared = Arc::new_cyclic(|weak: &Weak<ClientShared>| {
			let handle = ClientHandle {
				shared: weak.clone(),
			};
			ClientShared {
				reactor: reactor.clone(),
				fiber: PoolFiber::new(pool.clone(), reactor.clone()),
				host: host.into(),
				port,
				path: path.into(),
				config,
				state: Mutex::new(ClientState::NotConnected),
				sink: Arc::new(Mutex::new(HandlerDispatch {
					handler,
					state: None,
					handle,
				})),
				reconnect_allowed: AtomicBool::new(true),
				attempt_seq: AtomicU64::new(0),
				rng: Mutex::new(rng),
			}
		});

		let starter = shared.clone();
		shared.reactor.execute(move || starter.start_attempt(false));

		Self { shared }
	}

	pub fn handle(&self) -> ClientHandle {
		ClientHandle {
			shared: Arc::downgrade(&self.shared),
		}
	}

	pub fn send(&self, text: &str) -> SendResult {
		self.shared.send_frame(Frame::text(text))
	}

	pub fn send_binary(&self, data: &[u8]) -> SendResult {
		self.shared.send_frame(Frame::binary(data.to_vec()))
	}

	/// Begin the close handshake; every later send returns `Closed`.
	pub fn send_close(&self) -> SendResult {
		self.shared.send_close()
	}

	/// Close the session and latch reconnects off.
	pub fn stop(&self) {
		self.shared.stop();
	}

	pub fn is_open(&self) -> bool {
		matches!(*self.shared.state.lock().unwrap(), ClientState::Open { .. })
	}
}

enum ClientState {
	NotConnected,
	AwaitingConnect {
		attempt: u64,
	},
	Handshaking {
		attempt: u64,
		writer: Writer,
	},
	Open {
		attempt: u64,
		writer: Writer,
	},
	Closing {
		attempt: u64,
		writer: Writer,
	},
	Closed,
}

impl ClientState {
	fn attempt(&self) -> Option<u64> {
		match self {
			Self::AwaitingConnect { attempt }
			| Self::Handshaking { attempt, .. }
			| Self::Open { attempt, .. }
			| Self::Closing { attempt, .. } => Some(*attempt),
			Self::NotConnected | Self::Closed => None,
		}
	}
}

struct ClientShared {
	reactor: ReactorHandle,
	fiber: PoolFiber,
	host: String,
	port: u16,
	path: String,
	config: ClientConfig,
	state: Mutex<ClientState>,
	sink: Arc<Mutex<dyn Dispatch>>,
	/// Latched off by `stop()`; mutated only on the reactor thread.
	reconnect_allowed: AtomicBool,
	attempt_seq: AtomicU64,
	rng: Mutex<StdRng>,
}

impl ClientShared {
	fn next_mask(&self) -> [u8; 4] {
		let mut mask = [0u8; 4];
		self.rng.lock().unwrap().fill_bytes(&mut mask);
		mask
	}

	fn send_frame(&self, frame: Frame) -> SendResult {
		let mask = self.next_mask();
		let state = self.state.lock().unwrap();
		match &*state {
			ClientState::Open { writer, .. } => writer.send(encode_frame(&frame, Some(mask))),
			_ => SendResult::Closed,
		}
	}

	fn send_close(&self) -> SendResult {
		let mask = self.next_mask();
		let mut state = self.state.lock().unwrap();
		match std::mem::replace(&mut *state, ClientState::Closed) {
			ClientState::Open { attempt, writer } => {
				let close = Frame::close(close_code::NORMAL, "");
				let result = writer.send_close(encode_frame(&close, Some(mask)));
				*state = ClientState::Closing { attempt, writer };
				result
			}
			other => {
				*state = other;
				SendResult::Closed
			}
		}
	}

	fn stop(self: &Arc<Self>) {
		let shared = self.clone();
		self.reactor.execute(move || {
			shared.reconnect_allowed.store(false, Ordering::Release);
			let mut state = shared.state.lock().unwrap();
			match std::mem::replace(&mut *state, ClientState::Closed) {
				ClientState::Handshaking { writer, .. }
				| ClientState::Open { writer, .. }
				| ClientState::Closing { writer, .. } => {
					let mask = {
						let mut rng = shared.rng.lock().unwrap();
						let mut mask = [0u8; 4];
						rng.fill_bytes(&mut mask);
						mask
					};
					let close = Frame::close(close_code::GOING_AWAY, "");
					let _ = writer.send_close(encode_frame(&close, Some(mask)));
					writer.mark_closed();
				}
				_ => {}
			}
		});
	}

	/// Reactor thread only.
	fn start_attempt(self: &Arc<Self>, is_reconnect: bool) {
		if is_reconnect && !self.reconnect_allowed.load(Ordering::Acquire) {
			return;
		}
		{
			let state = self.state.lock().unwrap();
			match &*state {
				ClientState::NotConnected | ClientState::Closed => {}
				// an attempt is already in flight
				_ => return,
			}
		}

		let attempt = self.attempt_seq.fetch_add(1, Ordering::Relaxed) + 1;
		tracing::debug!(host = %self.host, port = self.port, attempt, "connecting");

		let addr = match (self.host.as_str(), self.port).to_socket_addrs() {
			Ok(mut addrs) => addrs.next(),
			Err(_) => None,
		};
		let Some(addr) = addr else {
			self.connect_failed(
				attempt,
				io::Error::new(io::ErrorKind::NotFound, "address resolution failed"),
			);
			return;
		};

		let stream = match TcpStream::connect(addr) {
			Ok(stream) => stream,
			Err(error) => {
				self.connect_failed(attempt, error);
				return;
			}
		};
		let stream = Arc::new(stream);
		let writer = Writer::new(stream.clone(), self.reactor.clone(), self.config.high_water_mark);
		let key = generate_key(&mut self.rng.lock().unwrap());

		*self.state.lock().unwrap() = ClientState::AwaitingConnect { attempt };

		self.reactor.add_handler(ClientConn {
			shared: self.clone(),
			stream: stream.clone(),
			writer,
			attempt,
			key,
			read_buf: ReadBuffer::new(self.config.read_buffer_size, self.config.read_buffer_max),
			parser: FrameParser::new(false, self.config.max_frame_size),
			assembler: MessageAssembler::new(self.config.max_frame_size),
			connected: false,
			opened: false,
			failure: None,
			last_read: Arc::new(Mutex::new(Instant::now())),
			idle_timer: None,
			heartbeat: None,
			ended: false,
		});

		// abort the attempt if it has not opened within the deadline
		if !self.config.connect_timeout.is_zero() {
			let shared = self.clone();
			self.reactor.schedule(self.config.connect_timeout, move || {
				let state = shared.state.lock().unwrap();
				let stale = matches!(
					&*state,
					ClientState::AwaitingConnect { attempt: a } if *a == attempt
				) || matches!(
					&*state,
					ClientState::Handshaking { attempt: a, .. } if *a == attempt
				);
				if stale {
					tracing::debug!(attempt, "connect attempt timed out");
					let _ = stream.shutdown(std::net::Shutdown::Both);
				}
			});
		}
	}

	fn connect_failed(self: &Arc<Self>, attempt: u64, error: io::Error) {
		tracing::debug!(attempt, %error, "connect failed");
		*self.state.lock().unwrap() = ClientState::Closed;
		let error = NetworkError::Io(error);
		self.dispatch(move |sink| sink.exception(&error));
		self.maybe_reconnect();
	}

	/// Reactor thread only.
	fn maybe_reconnect(self: &Arc<Self>) {
		if !self.reconnect_allowed.load(Ordering::Acquire)
			|| !self.config.reconnect
			|| self.config.connect_timeout.is_zero()
		{
			return;
		}
		let shared = self.clone();
		self.reactor.schedule(self.config.connect_timeout, move || {
			shared.start_attempt(true);
		});
	}

	fn dispatch(&self, callback: impl FnOnce(&mut dyn Dispatch) + Send + 'static) {
		let sink = self.sink.clone();
		let posted = self.fiber.execute(move || {
			let mut guard = sink.lock().unwrap();
			callback(&mut *guard);
		});
		if posted.is_err() {
			tracing::debug!("session fiber rejected callback, pool shutting down");
		}
	}
}

/// Type-erased bridge from the reactor to the typed handler.
trait Dispatch: Send {
	fn open(&mut self, response: &UpgradeResponse);
	fn message(&mut self, text: &str);
	fn binary(&mut self, data: &[u8]);
	fn error(&mut self, reason: &str);
	fn exception(&mut self, error: &NetworkError);
	fn close(&mut self);
}

struct HandlerDispatch<H: ClientHandler> {
	handler: H,
	state: Option<H::State>,
	handle: ClientHandle,
}

impl<H: ClientHandler> Dispatch for HandlerDispatch<H> {
	fn open(&mut self, response: &UpgradeResponse) {
		self.state = Some(self.handler.on_open(&self.handle, response));
	}

	fn message(&mut self, text: &str) {
		if let Some(state) = self.state.as_mut() {
			self.handler.on_message(&self.handle, state, text);
		}
	}

	fn binary(&mut self, data: &[u8]) {
		if let Some(state) = self.state.as_mut() {
			self.handler.on_binary_message(&self.handle, state, data);
		}
	}

	fn error(&mut self, reason: &str) {
		self.handler.on_error(&self.handle, self.state.as_mut(), reason);
	}

	fn exception(&mut self, error: &NetworkError) {
		self.handler.on_exception(&self.handle, self.state.as_mut(), error);
	}

	fn close(&mut self) {
		if let Some(mut state) = self.state.take() {
			self.handler.on_close(&self.handle, &mut state);
		}
	}
}

/// Reactor handler for one connect attempt.
struct ClientConn {
	shared: Arc<ClientShared>,
	stream: Arc<TcpStream>,
	writer: Writer,
	attempt: u64,
	key: String,
	read_buf: ReadBuffer,
	parser: FrameParser,
	assembler: MessageAssembler,
	connected: bool,
	opened: bool,
	failure: Option<NetworkError>,
	last_read: Arc<Mutex<Instant>>,
	idle_timer: Option<TimerHandle>,
	heartbeat: Option<TimerHandle>,
	ended: bool,
}

enum Phase {
	Handshaking,
	Open,
	Draining,
	Stale,
}

impl ClientConn {
	fn phase(&self) -> Phase {
		let state = self.shared.state.lock().unwrap();
		if state.attempt() != Some(self.attempt) {
			return Phase::Stale;
		}
		match &*state {
			ClientState::Handshaking { .. } => Phase::Handshaking,
			ClientState::Open { .. } => Phase::Open,
			_ => Phase::Draining,
		}
	}

	fn finish_connect(&mut self) -> bool {
		match self.stream.take_error() {
			Ok(Some(error)) | Err(error) => {
				self.failure = Some(NetworkError::Io(error));
				return false;
			}
			Ok(None) => {}
		}
		if let Err(error) = self.stream.peer_addr() {
			if error.kind() == io::ErrorKind::NotConnected {
				// spurious wake-up, keep waiting
				return true;
			}
			self.failure = Some(NetworkError::Io(error));
			return false;
		}

		self.connected = true;
		let request =
			build_upgrade_request(&self.shared.host, self.shared.port, &self.shared.path, &self.key);
		if self.writer.send(request) == SendResult::Closed {
			self.failure = Some(NetworkError::Closed);
			return false;
		}

		let mut state = self.shared.state.lock().unwrap();
		if state.attempt() == Some(self.attempt) {
			*state = ClientState::Handshaking {
				attempt: self.attempt,
				writer: self.writer.clone(),
			};
			true
		} else {
			false
		}
	}

	fn process(&mut self) -> bool {
		loop {
			match self.phase() {
				Phase::Handshaking => match self.process_handshake() {
					Some(true) => continue,
					Some(false) => return false,
					None => return true,
				},
				Phase::Open => return self.process_frames(),
				Phase::Draining => {
					let len = self.read_buf.len();
					self.read_buf.consume(len);
					return true;
				}
				Phase::Stale => return false,
			}
		}
	}

	fn process_handshake(&mut self) -> Option<bool> {
		match parse_upgrade_response(self.read_buf.data(), &self.key) {
			Ok(None) => None,
			Ok(Some((response, consumed))) => {
				self.read_buf.consume(consumed);
				Some(self.open_session(response))
			}
			Err(error) => {
				tracing::debug!(%error, "handshake failed");
				let reason = error.to_string();
				self.failure = Some(NetworkError::Handshake(error));
				self.shared.dispatch(move |sink| sink.error(&reason));
				Some(false)
			}
		}
	}

	fn open_session(&mut self, response: UpgradeResponse) -> bool {
		{
			let mut state = self.shared.state.lock().unwrap();
			match std::mem::replace(&mut *state, ClientState::Closed) {
				ClientState::Handshaking { attempt, writer } if attempt == self.attempt => {
					*state = ClientState::Open { attempt, writer };
				}
				other => {
					*state = other;
					return false;
				}
			}
		}
		self.opened = true;
		tracing::debug!(attempt = self.attempt, "session open");

		if !self.shared.config.heartbeat_interval.is_zero() {
			let interval = self.shared.config.heartbeat_interval;
			let shared = self.shared.clone();
			self.heartbeat = Some(self.shared.fiber.schedule_with_fixed_delay(
				interval,
				interval,
				move || {
					let ping = Frame::ping(Vec::new());
					let _ = shared.send_frame(ping);
				},
			));
		}

		if !self.shared.config.read_timeout.is_zero() {
			let timeout = self.shared.config.read_timeout;
			let last_read = self.last_read.clone();
			let stream = self.stream.clone();
			self.idle_timer = Some(self.shared.reactor.schedule_with_fixed_delay(
				timeout,
				timeout,
				move || {
					if last_read.lock().unwrap().elapsed() > timeout {
						tracing::debug!("idle read timeout, closing session");
						let _ = stream.shutdown(std::net::Shutdown::Both);
					}
				},
			));
		}

		self.shared.dispatch(move |sink| sink.open(&response));
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
				self.shared.dispatch(move |sink| sink.message(&text));
				true
			}
			WsEvent::Binary(data) => {
				self.shared.dispatch(move |sink| sink.binary(&data));
				true
			}
			WsEvent::Ping(payload) => {
				let mask = self.shared.next_mask();
				let pong = encode_frame(&Frame::pong(payload), Some(mask));
				self.writer.send_priority(pong) != SendResult::Closed
			}
			WsEvent::Pong(_) => true,
			WsEvent::Close { code, .. } => {
				let mask = self.shared.next_mask();
				let echo = Frame::close(code.unwrap_or(close_code::NORMAL), "");
				let result = self.writer.send_close(encode_frame(&echo, Some(mask)));
				self.to_closing();
				!matches!(result, SendResult::Sent | SendResult::Closed)
			}
		}
	}

	fn to_closing(&self) {
		let mut state = self.shared.state.lock().unwrap();
		match std::mem::replace(&mut *state, ClientState::Closed) {
			ClientState::Open { attempt, writer } if attempt == self.attempt => {
				*state = ClientState::Closing { attempt, writer };
			}
			other => *state = other,
		}
	}

	fn protocol_error(&mut self, error: FrameError) {
		tracing::debug!(%error, code = error.close_code(), "protocol violation");
		let mask = self.shared.next_mask();
		let close = Frame::close(error.close_code(), &error.to_string());
		let _ = self.writer.send_close(encode_frame(&close, Some(mask)));
		let reason = error.to_string();
		self.shared.dispatch(move |sink| sink.error(&reason));
	}

	fn teardown(&mut self) {
		if self.ended {
			return;
		}
		self.ended = true;

		if let Some(timer) = self.idle_timer.take() {
			timer.cancel();
		}
		if let Some(timer) = self.heartbeat.take() {
			timer.cancel();
		}

		{
			let mut state = self.shared.state.lock().unwrap();
			if state.attempt() == Some(self.attempt) {
				*state = ClientState::Closed;
			}
		}
		self.writer.mark_closed();

		if self.opened {
			self.shared.dispatch(|sink| sink.close());
		} else {
			let failure = self.failure.take().unwrap_or(NetworkError::Closed);
			self.shared.dispatch(move |sink| sink.exception(&failure));
		}

		self.shared.maybe_reconnect();
	}
}

impl SelectHandler for ClientConn {
	fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
		let fd = self.stream.as_raw_fd();
		registry.register(
			&mut SourceFd(&fd),
			token,
			Interest::READABLE | Interest::WRITABLE,
		)?;
		self.writer.bind(token);
		Ok(())
	}

	fn deregister(&mut self, registry: &Registry) {
		let fd = self.stream.as_raw_fd();
		let _ = registry.deregister(&mut SourceFd(&fd));
	}

	fn on_select(&mut self, cx: &mut SelectCx<'_>) -> bool {
		if !self.connected {
			if !self.finish_connect() {
				return false;
			}
			if !self.connected {
				// still waiting for the connect to complete
				return true;
			}
			let fd = self.stream.as_raw_fd();
			let _ = cx.registry.reregister(&mut SourceFd(&fd), cx.token, Interest::READABLE);
		}

		if cx.writable {
			match self.writer.on_writable(cx.registry) {
				DrainState::Closed => return false,
				DrainState::FinishedClose | DrainState::Idle | DrainState::Pending => {}
			}
		}

		if cx.readable {
			let outcome = match self
				.read_buf
				.fill(&self.stream, self.shared.config.max_read_loops)
			{
				Ok(outcome) => outcome,
				Err(error) => {
					self.failure = Some(NetworkError::Io(error));
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
