// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Fragmentation scenarios: a server-sent fragment sequence delivers one
//! client message; a ping interleaved inside a client-sent sequence is
//! answered immediately without disturbing reassembly.

use std::sync::Arc;

use weft::{
	network::ws::{encode_frame, Frame, Opcode},
	path_eq, ClientConfig, ClientHandle, ClientHandler, Reactor, Server, ServerConfig,
	SessionHandler, SessionHandlerFactory, StreamSession, WorkerPool, WsClient,
};
use weft_testing::{busy_wait, EventSink};

mod common;
use common::RawClient;

/// Echoes text; on "frag" replies with a three-fragment "hello".
struct FragHandler;

impl SessionHandler for FragHandler {
	fn on_message(&mut self, session: &Arc<StreamSession>, text: &str) {
		if text == "frag" {
			let parts: [(&[u8], Opcode, bool); 3] = [
				(b"he", Opcode::Text, false),
				(b"ll", Opcode::Continuation, false),
				(b"o", Opcode::Continuation, true),
			];
			for (payload, opcode, fin) in parts {
				session.send_frame_bytes(encode_frame(
					&Frame {
						fin,
						opcode,
						payload: payload.to_vec(),
					},
					None,
				));
			}
		} else {
			session.send_text(text);
		}
	}
}

fn start_server() -> Server {
	let factory: Arc<dyn SessionHandlerFactory> =
		Arc::new(|| Box::new(FragHandler) as Box<dyn SessionHandler>);
	Server::start(0, ServerConfig::new().add(path_eq("/frag"), factory)).unwrap()
}

struct Probe {
	messages: Arc<EventSink<String>>,
}

impl ClientHandler for Probe {
	type State = ();

	fn on_open(
		&mut self,
		_conn: &ClientHandle,
		_response: &weft::network::ws::UpgradeResponse,
	) {
	}

	fn on_message(&mut self, _conn: &ClientHandle, _state: &mut (), text: &str) {
		self.messages.push(text.to_string());
	}
}

#[test]
fn test_server_fragments_deliver_one_message() {
	let server = start_server();
	let addr = server.local_addr();

	let reactor = Reactor::spawn("frag-client").unwrap();
	let pool = WorkerPool::new(2);
	let messages = Arc::new(EventSink::new());
	let client = WsClient::open(
		reactor.handle(),
		&pool,
		"127.0.0.1",
		addr.port(),
		"/frag",
		ClientConfig::new().reconnect(false).mask_seed(0xF1),
		Probe {
			messages: messages.clone(),
		},
	);

	busy_wait(|| client.is_open().then_some(()));
	client.send("frag");

	messages.wait_for(1);
	// give a stray duplicate a moment to show up before asserting exactly one
	std::thread::sleep(std::time::Duration::from_millis(100));
	assert_eq!(messages.snapshot(), vec!["hello".to_string()]);

	client.stop();
	pool.shutdown();
	reactor.dispose();
	server.stop();
}

#[test]
fn test_ping_interleaved_in_fragment_sequence() {
	let server = start_server();
	let addr = server.local_addr();
	let mut raw = RawClient::connect(addr, "/frag");

	raw.send_frame(false, 0x1, b"AB");
	raw.send_frame(true, 0x9, b"x");
	raw.send_frame(true, 0x0, b"CD");

	// the pong answers immediately, ahead of the echoed message
	let (opcode, fin, payload) = raw.read_frame();
	assert_eq!((opcode, fin), (0xA, true));
	assert_eq!(payload, b"x");

	// reassembly was undisturbed: the echo is one complete text message
	let (opcode, fin, payload) = raw.read_frame();
	assert_eq!((opcode, fin), (0x1, true));
	assert_eq!(payload, b"ABCD");

	server.stop();
}
