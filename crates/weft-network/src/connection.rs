// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Per-connection read buffer: growable, bounded, with shrink heuristics so
//! a burst does not pin memory for the connection's lifetime.

use std::io::{self, Read};

use mio::net::TcpStream;

/// Shrink if capacity grows above this and the buffer is mostly empty.
const SHRINK_THRESHOLD: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// What a fill pass observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
	pub bytes: usize,
	pub eof: bool,
	/// The buffer hit its configured maximum; the connection should close.
	pub overflow: bool,
	/// The pass ended on the loop limit, not on WouldBlock: the socket may
	/// still be readable and interest must be re-armed (the poll is
	/// edge-triggered).
	pub exhausted: bool,
}

#[derive(Debug)]
pub struct ReadBuffer {
	buf: Vec<u8>,
	initial: usize,
	max: usize,
}

impl ReadBuffer {
	pub fn new(initial: usize, max: usize) -> Self {
		Self {
			buf: Vec::with_capacity(initial),
			initial,
			max,
		}
	}

	pub fn data(&self) -> &[u8] {
		&self.buf
	}

	pub fn len(&self) -> usize {
		self.buf.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buf.is_empty()
	}

	/// Read from the socket until it would block, EOF, `max_loops` passes, or
	/// the configured maximum is reached.
	pub fn fill(&mut self, stream: &TcpStream, max_loops: usize) -> io::Result<FillOutcome> {
		let mut outcome = FillOutcome {
			bytes: 0,
			eof: false,
			overflow: false,
			exhausted: true,
		};
		let mut chunk = [0u8; READ_CHUNK];

		for _ in 0..max_loops.max(1) {
			if self.buf.len() >= self.max {
				outcome.overflow = true;
				outcome.exhausted = false;
				break;
			}
			let mut stream_ref = stream;
			match stream_ref.read(&mut chunk) {
				Ok(0) => {
					outcome.eof = true;
					outcome.exhausted = false;
					break;
				}
				Ok(n) => {
					self.buf.extend_from_slice(&chunk[..n]);
					outcome.bytes += n;
				}
				Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
					outcome.exhausted = false;
					break;
				}
				Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
				Err(error) => return Err(error),
			}
		}

		Ok(outcome)
	}

	/// Drop `n` consumed bytes from the front.
	pub fn consume(&mut self, n: usize) {
		self.buf.drain(..n.min(self.buf.len()));
		self.optimize();
	}

	/// Release capacity a burst left behind.
	fn optimize(&mut self) {
		let capacity = self.buf.capacity();
		if capacity > SHRINK_THRESHOLD && self.buf.len() < capacity / 4 {
			let target = (self.buf.len() * 2).max(self.initial);
			if target < capacity {
				self.buf.shrink_to(target);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{io::Write, net::TcpListener};

	use super::*;

	fn socket_pair() -> (TcpStream, std::net::TcpStream) {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		let peer = std::net::TcpStream::connect(addr).unwrap();
		let (accepted, _) = listener.accept().unwrap();
		accepted.set_nonblocking(true).unwrap();
		(TcpStream::from_std(accepted), peer)
	}

	#[test]
	fn test_fill_reads_available_bytes() {
		let (stream, mut peer) = socket_pair();
		peer.write_all(b"abcdef").unwrap();
		// give the kernel a moment to move the bytes across loopback
		std::thread::sleep(std::time::Duration::from_millis(20));

		let mut buffer = ReadBuffer::new(16, 1024);
		let outcome = buffer.fill(&stream, 50).unwrap();
		assert_eq!(outcome.bytes, 6);
		assert!(!outcome.eof);
		assert_eq!(buffer.data(), b"abcdef");
	}

	#[test]
	fn test_fill_reports_eof() {
		let (stream, peer) = socket_pair();
		drop(peer);
		std::thread::sleep(std::time::Duration::from_millis(20));

		let mut buffer = ReadBuffer::new(16, 1024);
		let outcome = buffer.fill(&stream, 50).unwrap();
		assert!(outcome.eof);
	}

	#[test]
	fn test_fill_stops_at_maximum() {
		let (stream, mut peer) = socket_pair();
		peer.write_all(&[0u8; 64 * 1024]).unwrap();
		std::thread::sleep(std::time::Duration::from_millis(20));

		let mut buffer = ReadBuffer::new(16, 8 * 1024);
		let outcome = buffer.fill(&stream, 1000).unwrap();
		assert!(outcome.overflow);
		assert!(buffer.len() <= 8 * 1024 + READ_CHUNK);
	}

	#[test]
	fn test_consume_drops_front() {
		let (stream, mut peer) = socket_pair();
		peer.write_all(b"abcdef").unwrap();
		std::thread::sleep(std::time::Duration::from_millis(20));

		let mut buffer = ReadBuffer::new(16, 1024);
		buffer.fill(&stream, 50).unwrap();
		buffer.consume(4);
		assert_eq!(buffer.data(), b"ef");
	}
}
