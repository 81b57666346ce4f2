// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! HTTP Upgrade handshake (RFC 6455 §4).

use std::collections::HashMap;

use base64::{prelude::BASE64_STANDARD, Engine};
use rand::{rngs::StdRng, RngCore};
use sha1::{digest::Digest, Sha1};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
	#[error("malformed http message: {0}")]
	Malformed(String),

	#[error("only GET requests can upgrade")]
	MethodNotAllowed,

	#[error("missing or invalid websocket upgrade headers")]
	NotAnUpgrade,

	#[error("unsupported websocket version, expected 13")]
	BadVersion,

	#[error("missing or malformed Sec-WebSocket-Key")]
	BadKey,

	#[error("unexpected http status {0}, expected 101")]
	BadStatus(u16),

	#[error("Sec-WebSocket-Accept does not match the sent key")]
	AcceptMismatch,
}

/// A parsed, validated upgrade request.
///
/// Header names are lowercased; duplicate headers keep the last value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
	pub path: String,
	pub headers: HashMap<String, String>,
	pub key: String,
}

impl UpgradeRequest {
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
	}
}

/// The validated `101 Switching Protocols` response, as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponse {
	pub status: u16,
	pub headers: HashMap<String, String>,
}

impl UpgradeResponse {
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
	}
}

/// Find the end of the HTTP headers (double CRLF).
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
	let pattern = b"\r\n\r\n";
	buf.windows(4).position(|window| window == pattern).map(|pos| pos + 4)
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
	haystack
		.as_bytes()
		.windows(needle.len())
		.any(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

fn header_map(headers: &[httparse::Header<'_>]) -> HashMap<String, String> {
	let mut map = HashMap::new();
	for header in headers {
		map.insert(
			header.name.to_ascii_lowercase(),
			String::from_utf8_lossy(header.value).into_owned(),
		);
	}
	map
}

/// Parse and validate an upgrade request from the accepting side.
///
/// Returns `Ok(None)` until the full header block is buffered, then the
/// request and the number of bytes consumed.
pub fn parse_upgrade_request(
	buf: &[u8],
) -> Result<Option<(UpgradeRequest, usize)>, HandshakeError> {
	let Some(end) = find_header_end(buf) else {
		return Ok(None);
	};

	let mut headers = [httparse::EMPTY_HEADER; 32];
	let mut request = httparse::Request::new(&mut headers);
	let status = request
		.parse(&buf[..end])
		.map_err(|error| HandshakeError::Malformed(error.to_string()))?;
	if status.is_partial() {
		return Ok(None);
	}

	if request.method != Some("GET") {
		return Err(HandshakeError::MethodNotAllowed);
	}
	let path = request.path.unwrap_or("/").to_string();
	let map = header_map(request.headers);

	let upgrade_ok = map
		.get("upgrade")
		.is_some_and(|value| contains_ci(value, "websocket"));
	let connection_ok = map
		.get("connection")
		.is_some_and(|value| contains_ci(value, "upgrade"));
	if !(upgrade_ok && connection_ok) {
		return Err(HandshakeError::NotAnUpgrade);
	}

	if map.get("sec-websocket-version").map(String::as_str) != Some("13") {
		return Err(HandshakeError::BadVersion);
	}

	let key = map
		.get("sec-websocket-key")
		.cloned()
		.ok_or(HandshakeError::BadKey)?;
	// the key must decode to a 16-byte nonce
	match BASE64_STANDARD.decode(key.trim()) {
		Ok(nonce) if nonce.len() == 16 => {}
		_ => return Err(HandshakeError::BadKey),
	}

	Ok(Some((
		UpgradeRequest {
			path,
			headers: map,
			key: key.trim().to_string(),
		},
		end,
	)))
}

/// `Sec-WebSocket-Accept` for a given key.
pub fn accept_key(key: &str) -> String {
	let mut sha1 = Sha1::new();
	sha1.update(key.as_bytes());
	sha1.update(GUID.as_bytes());
	BASE64_STANDARD.encode(sha1.finalize())
}

pub fn build_accept_response(accept: &str) -> Vec<u8> {
	format!(
		"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
		accept
	)
	.into_bytes()
}

pub fn build_reject_response(status: u16, reason: &str) -> Vec<u8> {
	format!("HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n", status, reason)
		.into_bytes()
}

/// A fresh random 16-byte nonce, base64 encoded.
pub fn generate_key(rng: &mut StdRng) -> String {
	let mut nonce = [0u8; 16];
	rng.fill_bytes(&mut nonce);
	BASE64_STANDARD.encode(nonce)
}

pub fn build_upgrade_request(host: &str, port: u16, path: &str, key: &str) -> Vec<u8> {
	format!(
		"GET {path} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {key}\r\n\r\n"
	)
	.into_bytes()
}

/// Parse and validate the server's `101` response on the connecting side.
pub fn parse_upgrade_response(
	buf: &[u8],
	sent_key: &str,
) -> Result<Option<(UpgradeResponse, usize)>, HandshakeError> {
	let Some(end) = find_header_end(buf) else {
		return Ok(None);
	};

	let mut headers = [httparse::EMPTY_HEADER; 32];
	let mut response = httparse::Response::new(&mut headers);
	let status = response
		.parse(&buf[..end])
		.map_err(|error| HandshakeError::Malformed(error.to_string()))?;
	if status.is_partial() {
		return Ok(None);
	}

	let code = response.code.unwrap_or(0);
	if code != 101 {
		return Err(HandshakeError::BadStatus(code));
	}

	let map = header_map(response.headers);
	let expected = accept_key(sent_key);
	if map.get("sec-websocket-accept").map(String::as_str) != Some(expected.as_str()) {
		return Err(HandshakeError::AcceptMismatch);
	}

	Ok(Some((
		UpgradeResponse {
			status: code,
			headers: map,
		},
		end,
	)))
}
