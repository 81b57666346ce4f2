// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! The non-blocking writer.
//!
//! Producers on any thread call [`Writer::send`] under a short critical
//! section: when the buffer is idle the bytes are written straight to the
//! socket; a short write buffers the residue and arms write interest through
//! a reactor task. Only the reactor drains the buffer afterwards. Exceeding
//! the high-water mark is terminal for the connection.

use std::{
	collections::VecDeque,
	io::{self, Write},
	net::Shutdown,
	os::fd::AsRawFd,
	sync::{Arc, Mutex},
};

use mio::{net::TcpStream, unix::SourceFd, Interest, Registry, Token};
use weft_core::ReactorHandle;

/// Outcome of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
	/// Everything hit the socket; nothing is buffered.
	Sent,
	/// Bytes are pending; the value is the total buffered after this send.
	Buffered(usize),
	/// The writer is closing, closed, or overflowed.
	Closed,
}

/// What the reactor learned from a drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
	/// Buffer drained; write interest was disarmed.
	Idle,
	/// Bytes remain buffered; write interest stays armed.
	Pending,
	/// Buffer drained while closing; the write side was shut down.
	FinishedClose,
	/// The writer is already closed.
	Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
	Open,
	Closing,
	Closed,
}

#[derive(Clone)]
pub struct Writer {
	shared: Arc<WriterShared>,
}

struct WriterShared {
	stream: Arc<TcpStream>,
	reactor: ReactorHandle,
	inner: Mutex<Inner>,
}

struct Inner {
	queue: VecDeque<Vec<u8>>,
	head_offset: usize,
	buffered: usize,
	state: WriterState,
	token: Option<Token>,
	armed: bool,
	high_water: usize,
}

impl Writer {
	pub fn new(stream: Arc<TcpStream>, reactor: ReactorHandle, high_water: usize) -> Self {
		Self {
			shared: Arc::new(WriterShared {
				stream,
				reactor,
				inner: Mutex::new(Inner {
					queue: VecDeque::new(),
					head_offset: 0,
					buffered: 0,
					state: WriterState::Open,
					token: None,
					armed: false,
					high_water,
				}),
			}),
		}
	}

	/// Bind the poll token once the connection is registered. Until then,
	/// sends buffer without arming write interest.
	pub fn bind(&self, token: Token) {
		self.shared.inner.lock().unwrap().token = Some(token);
	}

	pub fn send(&self, bytes: Vec<u8>) -> SendResult {
		self.enqueue(bytes, false)
	}

	/// Priority lane: the chunk goes ahead of pending data chunks but never
	/// splits a partially written one. Used for pong replies.
	pub fn send_priority(&self, bytes: Vec<u8>) -> SendResult {
		self.enqueue(bytes, true)
	}

	/// Queue a close frame and flip to draining-only: every later send
	/// returns [`SendResult::Closed`] and the write side is half-closed once
	/// the buffer drains.
	pub fn send_close(&self, close_frame: Vec<u8>) -> SendResult {
		let mut inner = self.shared.inner.lock().unwrap();
		match inner.state {
			WriterState::Closing | WriterState::Closed => return SendResult::Closed,
			WriterState::Open => {}
		}
		inner.state = WriterState::Closing;

		if inner.buffered == 0 {
			match self.write_direct(&mut inner, close_frame) {
				SendResult::Sent => {
					// nothing left to drain
					let _ = self.shared.stream.shutdown(Shutdown::Write);
					SendResult::Sent
				}
				other => other,
			}
		} else {
			let len = close_frame.len();
			inner.queue.push_back(close_frame);
			inner.buffered += len;
			if !inner.armed {
				self.arm(&mut inner);
			}
			SendResult::Buffered(inner.buffered)
		}
	}

	/// Drain pass, reactor thread only.
	pub fn on_writable(&self, registry: &Registry) -> DrainState {
		let mut inner = self.shared.inner.lock().unwrap();
		if inner.state == WriterState::Closed {
			return DrainState::Closed;
		}

		loop {
			let Some(chunk) = inner.queue.pop_front() else {
				break;
			};
			let offset = inner.head_offset;
			let mut stream = &*self.shared.stream;
			match stream.write(&chunk[offset..]) {
				Ok(0) => {
					self.fail(&mut inner);
					return DrainState::Closed;
				}
				Ok(written) => {
					inner.buffered -= written;
					if offset + written == chunk.len() {
						inner.head_offset = 0;
					} else {
						inner.head_offset = offset + written;
						inner.queue.push_front(chunk);
					}
				}
				Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
					inner.queue.push_front(chunk);
					break;
				}
				Err(error) if error.kind() == io::ErrorKind::Interrupted => {
					inner.queue.push_front(chunk);
				}
				Err(_) => {
					self.fail(&mut inner);
					return DrainState::Closed;
				}
			}
		}

		if !inner.queue.is_empty() {
			return DrainState::Pending;
		}

		inner.armed = false;
		if let Some(token) = inner.token {
			let fd = self.shared.stream.as_raw_fd();
			let _ = registry.reregister(&mut SourceFd(&fd), token, Interest::READABLE);
		}

		if inner.state == WriterState::Closing {
			let _ = self.shared.stream.shutdown(Shutdown::Write);
			DrainState::FinishedClose
		} else {
			DrainState::Idle
		}
	}

	/// Total bytes currently buffered.
	pub fn buffered(&self) -> usize {
		self.shared.inner.lock().unwrap().buffered
	}

	/// Bytes are pending and write interest matters.
	pub fn is_pending(&self) -> bool {
		let inner = self.shared.inner.lock().unwrap();
		inner.buffered > 0 && inner.state != WriterState::Closed
	}

	pub fn is_closed(&self) -> bool {
		self.shared.inner.lock().unwrap().state == WriterState::Closed
	}

	/// Terminal teardown; safe to call more than once.
	pub fn mark_closed(&self) {
		let mut inner = self.shared.inner.lock().unwrap();
		if inner.state != WriterState::Closed {
			self.fail(&mut inner);
		}
	}

	fn enqueue(&self, bytes: Vec<u8>, priority: bool) -> SendResult {
		if bytes.is_empty() {
			return SendResult::Sent;
		}
		let mut inner = self.shared.inner.lock().unwrap();
		match inner.state {
			WriterState::Closing | WriterState::Closed => return SendResult::Closed,
			WriterState::Open => {}
		}

		if inner.buffered == 0 {
			return self.write_direct(&mut inner, bytes);
		}

		let len = bytes.len();
		if priority && inner.head_offset > 0 {
			// after the partially written head, before everything else
			inner.queue.insert(1, bytes);
		} else if priority {
			inner.queue.push_front(bytes);
		} else {
			inner.queue.push_back(bytes);
		}
		inner.buffered += len;

		if inner.buffered > inner.high_water {
			tracing::warn!(
				buffered = inner.buffered,
				high_water = inner.high_water,
				"send buffer overflow, closing connection"
			);
			return self.fail(&mut inner);
		}
		if !inner.armed {
			self.arm(&mut inner);
		}
		SendResult::Buffered(inner.buffered)
	}

	/// Write as much as the socket takes; buffer the residue.
	fn write_direct(&self, inner: &mut Inner, bytes: Vec<u8>) -> SendResult {
		let mut written = 0;
		loop {
			let mut stream = &*self.shared.stream;
			match stream.write(&bytes[written..]) {
				Ok(0) => return self.fail(inner),
				Ok(n) => {
					written += n;
					if written == bytes.len() {
						return SendResult::Sent;
					}
				}
				Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
				Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
				Err(_) => return self.fail(inner),
			}
		}

		let residue = bytes.len() - written;
		inner.queue.push_back(bytes);
		inner.head_offset = written;
		inner.buffered = residue;

		if inner.buffered > inner.high_water {
			tracing::warn!(
				buffered = inner.buffered,
				high_water = inner.high_water,
				"send buffer overflow, closing connection"
			);
			return self.fail(inner);
		}
		if !inner.armed {
			self.arm(inner);
		}
		SendResult::Buffered(inner.buffered)
	}

	fn fail(&self, inner: &mut Inner) -> SendResult {
		inner.state = WriterState::Closed;
		inner.queue.clear();
		inner.buffered = 0;
		inner.head_offset = 0;
		// the reactor observes the shutdown and tears the connection down;
		// double-close is swallowed
		let _ = self.shared.stream.shutdown(Shutdown::Both);
		SendResult::Closed
	}

	fn arm(&self, inner: &mut Inner) {
		let Some(token) = inner.token else {
			return;
		};
		inner.armed = true;
		let stream = self.shared.stream.clone();
		self.shared.reactor.submit(move |core| {
			let fd = stream.as_raw_fd();
			let _ = core.registry().reregister(
				&mut SourceFd(&fd),
				token,
				Interest::READABLE | Interest::WRITABLE,
			);
		});
	}
}

#[cfg(test)]
mod tests {
	use std::{io::Read, net::TcpListener, time::Duration};

	use weft_core::Reactor;
	use weft_testing::busy_wait;

	use super::*;

	/// A connected non-blocking pair: the mio end under test and a std peer.
	fn socket_pair() -> (Arc<TcpStream>, std::net::TcpStream) {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		let std_stream = std::net::TcpStream::connect(addr).unwrap();
		let (accepted, _) = listener.accept().unwrap();
		accepted.set_nonblocking(true).unwrap();
		(Arc::new(TcpStream::from_std(accepted)), std_stream)
	}

	#[test]
	fn test_small_send_goes_straight_through() {
		let reactor = Reactor::spawn("writer-test").unwrap();
		let (stream, mut peer) = socket_pair();
		let writer = Writer::new(stream, reactor.handle().clone(), 1 << 20);

		assert_eq!(writer.send(b"hello".to_vec()), SendResult::Sent);

		let mut buf = [0u8; 5];
		peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
		peer.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"hello");
		reactor.dispose();
	}

	#[test]
	fn test_slow_peer_buffers_then_overflows_to_closed() {
		let reactor = Reactor::spawn("writer-test").unwrap();
		let (stream, _peer) = socket_pair();
		// tiny high-water mark so the kernel buffer absorbs the first chunks
		let writer = Writer::new(stream, reactor.handle().clone(), 256 * 1024);

		let chunk = vec![b'X'; 1 << 20];
		let mut saw_closed = false;
		for _ in 0..16 {
			match writer.send(chunk.clone()) {
				SendResult::Closed => {
					saw_closed = true;
					break;
				}
				SendResult::Sent | SendResult::Buffered(_) => {}
			}
		}
		assert!(saw_closed, "writer never reported Closed under back-pressure");
		assert!(writer.is_closed());
		// terminal: everything after overflow is rejected
		assert_eq!(writer.send(b"more".to_vec()), SendResult::Closed);
		reactor.dispose();
	}

	#[test]
	fn test_send_after_close_returns_closed() {
		let reactor = Reactor::spawn("writer-test").unwrap();
		let (stream, mut peer) = socket_pair();
		let writer = Writer::new(stream, reactor.handle().clone(), 1 << 20);

		assert_eq!(writer.send_close(b"\x88\x00".to_vec()), SendResult::Sent);
		assert_eq!(writer.send(b"data".to_vec()), SendResult::Closed);
		assert_eq!(writer.send_close(b"\x88\x00".to_vec()), SendResult::Closed);

		// the close frame reached the wire before the half-close
		let mut buf = Vec::new();
		peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
		peer.read_to_end(&mut buf).unwrap();
		assert_eq!(buf, b"\x88\x00");
		reactor.dispose();
	}

	#[test]
	fn test_mark_closed_is_idempotent() {
		let reactor = Reactor::spawn("writer-test").unwrap();
		let (stream, _peer) = socket_pair();
		let writer = Writer::new(stream, reactor.handle().clone(), 1 << 20);

		writer.mark_closed();
		writer.mark_closed();
		assert!(writer.is_closed());
		assert_eq!(writer.send(b"x".to_vec()), SendResult::Closed);
		reactor.dispose();
	}

	#[test]
	fn test_buffered_residue_reported() {
		let reactor = Reactor::spawn("writer-test").unwrap();
		let (stream, _peer) = socket_pair();
		let writer = Writer::new(stream, reactor.handle().clone(), 1 << 30);

		// without a reader the kernel buffer fills and residue accumulates
		let chunk = vec![b'Y'; 4 << 20];
		let reported = busy_wait(|| match writer.send(chunk.clone()) {
			SendResult::Buffered(total) => Some(total),
			SendResult::Sent => None,
			SendResult::Closed => panic!("writer closed below the high-water mark"),
		});
		assert!(reported > 0);
		assert_eq!(writer.buffered(), reported);
		reactor.dispose();
	}
}
