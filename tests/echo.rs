// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! End-to-end echo: one message each way, exactly one open/message/close per
//! side.

use std::sync::Arc;

use weft::{
	path_eq, ClientConfig, ClientHandle, ClientHandler, Reactor, SendResult, Server,
	ServerConfig, SessionHandler, SessionHandlerFactory, StreamSession, WorkerPool, WsClient,
};
use weft_testing::{busy_wait, EventSink};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ServerEvent {
	Open,
	Message(String),
	Close,
}

struct EchoHandler {
	events: Arc<EventSink<ServerEvent>>,
}

impl SessionHandler for EchoHandler {
	fn on_open(
		&mut self,
		_session: &Arc<StreamSession>,
		_request: &weft::network::ws::UpgradeRequest,
	) {
		self.events.push(ServerEvent::Open);
	}

	fn on_message(&mut self, session: &Arc<StreamSession>, text: &str) {
		self.events.push(ServerEvent::Message(text.to_string()));
		session.send_text(text);
	}

	fn on_close(&mut self, _session: &Arc<StreamSession>) {
		self.events.push(ServerEvent::Close);
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientEvent {
	Open,
	Message(String),
	Close,
}

struct ClientProbe {
	events: Arc<EventSink<ClientEvent>>,
}

impl ClientHandler for ClientProbe {
	type State = ();

	fn on_open(
		&mut self,
		_conn: &ClientHandle,
		_response: &weft::network::ws::UpgradeResponse,
	) {
		self.events.push(ClientEvent::Open);
	}

	fn on_message(&mut self, _conn: &ClientHandle, _state: &mut (), text: &str) {
		self.events.push(ClientEvent::Message(text.to_string()));
	}

	fn on_close(&mut self, _conn: &ClientHandle, _state: &mut ()) {
		self.events.push(ClientEvent::Close);
	}
}

#[test]
fn test_echo_roundtrip_with_clean_teardown() {
	let server_events = Arc::new(EventSink::new());
	let sink = server_events.clone();
	let factory: Arc<dyn SessionHandlerFactory> = Arc::new(move || {
		Box::new(EchoHandler {
			events: sink.clone(),
		}) as Box<dyn SessionHandler>
	});

	let server = Server::start(0, ServerConfig::new().add(path_eq("/echo"), factory)).unwrap();
	let addr = server.local_addr();

	let reactor = Reactor::spawn("echo-client").unwrap();
	let pool = WorkerPool::new(2);
	let client_events = Arc::new(EventSink::new());
	let client = WsClient::open(
		reactor.handle(),
		&pool,
		"127.0.0.1",
		addr.port(),
		"/echo",
		ClientConfig::new().reconnect(false).mask_seed(0xE0),
		ClientProbe {
			events: client_events.clone(),
		},
	);

	busy_wait(|| client.is_open().then_some(()));
	assert_eq!(client.send("hello"), SendResult::Sent);

	client_events.wait_for(2);
	assert_eq!(
		client_events.snapshot(),
		vec![ClientEvent::Open, ClientEvent::Message("hello".into())]
	);

	client.send_close();
	// after a local close, every further send reports Closed
	assert_eq!(client.send("late"), SendResult::Closed);

	client_events.wait_for(3);
	server_events.wait_for(3);
	assert_eq!(
		client_events.snapshot(),
		vec![
			ClientEvent::Open,
			ClientEvent::Message("hello".into()),
			ClientEvent::Close
		]
	);
	assert_eq!(
		server_events.snapshot(),
		vec![
			ServerEvent::Open,
			ServerEvent::Message("hello".into()),
			ServerEvent::Close
		]
	);

	pool.shutdown();
	reactor.dispose();
	server.stop();
}
