// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Raw-socket WebSocket peer for wire-level scenarios: hand-rolled frames,
//! exact control over fragmentation and masking.

use std::{
	io::{Read, Write},
	net::{SocketAddr, TcpStream},
	time::Duration,
};

pub const MASK: [u8; 4] = [0x1B, 0x2C, 0x3D, 0x4E];

pub struct RawClient {
	stream: TcpStream,
}

#[allow(dead_code)]
impl RawClient {
	/// Handshake against `path`, asserting a `101`.
	pub fn connect(addr: SocketAddr, path: &str) -> Self {
		let (client, status) = Self::connect_with_status(addr, path, "");
		assert_eq!(status, 101, "expected 101 Switching Protocols");
		client
	}

	/// Handshake with extra header lines; returns the raw status code too.
	pub fn connect_with_status(addr: SocketAddr, path: &str, extra: &str) -> (Self, u16) {
		let mut stream = TcpStream::connect(addr).unwrap();
		stream
			.set_read_timeout(Some(Duration::from_secs(10)))
			.unwrap();
		let request = format!(
			"GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\n{extra}Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
		);
		stream.write_all(request.as_bytes()).unwrap();

		let mut response = Vec::new();
		let mut byte = [0u8; 1];
		while !response.ends_with(b"\r\n\r\n") {
			stream.read_exact(&mut byte).unwrap();
			response.push(byte[0]);
		}
		let head = String::from_utf8_lossy(&response);
		let status: u16 = head
			.split_whitespace()
			.nth(1)
			.and_then(|code| code.parse().ok())
			.expect("malformed status line");
		(Self { stream }, status)
	}

	/// Send one masked frame. `opcode` is the raw 4-bit code.
	pub fn send_frame(&mut self, fin: bool, opcode: u8, payload: &[u8]) {
		let mut frame = Vec::with_capacity(payload.len() + 14);
		let fin_bit = if fin { 0x80 } else { 0x00 };
		frame.push(fin_bit | opcode);

		let len = payload.len();
		if len < 126 {
			frame.push(0x80 | len as u8);
		} else if len <= u16::MAX as usize {
			frame.push(0x80 | 126);
			frame.extend_from_slice(&(len as u16).to_be_bytes());
		} else {
			frame.push(0x80 | 127);
			frame.extend_from_slice(&(len as u64).to_be_bytes());
		}
		frame.extend_from_slice(&MASK);
		frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ MASK[i % 4]));
		self.stream.write_all(&frame).unwrap();
	}

	pub fn send_text(&mut self, text: &str) {
		self.send_frame(true, 0x1, text.as_bytes());
	}

	/// Read one (unmasked) server frame: `(opcode, fin, payload)`.
	pub fn read_frame(&mut self) -> (u8, bool, Vec<u8>) {
		let mut header = [0u8; 2];
		self.stream.read_exact(&mut header).unwrap();
		let fin = header[0] & 0x80 != 0;
		let opcode = header[0] & 0x0F;
		assert_eq!(header[1] & 0x80, 0, "server frames must not be masked");

		let mut len = (header[1] & 0x7F) as usize;
		if len == 126 {
			let mut ext = [0u8; 2];
			self.stream.read_exact(&mut ext).unwrap();
			len = u16::from_be_bytes(ext) as usize;
		} else if len == 127 {
			let mut ext = [0u8; 8];
			self.stream.read_exact(&mut ext).unwrap();
			len = u64::from_be_bytes(ext) as usize;
		}

		let mut payload = vec![0u8; len];
		self.stream.read_exact(&mut payload).unwrap();
		(opcode, fin, payload)
	}

	/// Read frames until a close frame arrives; returns its status code.
	pub fn read_until_close(&mut self) -> Option<u16> {
		loop {
			let (opcode, _fin, payload) = self.read_frame();
			if opcode == 0x8 {
				return payload
					.get(..2)
					.map(|code| u16::from_be_bytes([code[0], code[1]]));
			}
		}
	}

	pub fn stream(&mut self) -> &mut TcpStream {
		&mut self.stream
	}
}
