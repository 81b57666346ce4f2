// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Correlated request/reply through the broker's request hook.

use std::{sync::Arc, time::Duration};

use weft::{
	path_eq, Broker, ClientConfig, FabricClient, FabricEvents, Reactor, RequestHandler, Server,
	ServerConfig, SessionHandlerFactory, StreamSession, TopicRegistry, WorkerPool,
};
use weft_testing::busy_wait;

struct EchoService;

impl RequestHandler for EchoService {
	fn on_request(&self, session: &Arc<StreamSession>, id: &str, topic: &str, body: &str) {
		// requests to "silent" go unanswered so timeouts can be observed
		if topic != "silent" {
			session.reply(id, topic, &format!("ack:{body}"));
		}
	}
}

struct NoEvents;

impl FabricEvents for NoEvents {}

#[test]
fn test_request_gets_the_correlated_reply() {
	let registry = Arc::new(TopicRegistry::new());
	let broker: Arc<dyn SessionHandlerFactory> = Arc::new(
		Broker::new(registry.clone()).with_request_handler(Arc::new(EchoService)),
	);
	let server = Server::start(0, ServerConfig::new().add(path_eq("/fabric"), broker)).unwrap();

	let reactor = Reactor::spawn("request-client").unwrap();
	let pool = WorkerPool::new(2);
	let client = FabricClient::open(
		reactor.handle(),
		&pool,
		"127.0.0.1",
		server.local_addr().port(),
		"/fabric",
		ClientConfig::new().reconnect(false).mask_seed(0xD0),
		NoEvents,
	);
	busy_wait(|| client.is_open().then_some(()));

	let reply = client
		.request("svc", "ping", Duration::from_secs(5))
		.unwrap();
	assert_eq!(reply.topic, "svc");
	assert_eq!(reply.body, "ack:ping");

	// several in-flight requests stay correctly correlated
	for i in 0..8 {
		let reply = client
			.request("svc", format!("n{i}"), Duration::from_secs(5))
			.unwrap();
		assert_eq!(reply.body, format!("ack:n{i}"));
	}

	let timeout = client.request("silent", "anyone?", Duration::from_millis(100));
	assert!(timeout.is_err(), "unanswered request must time out");

	client.stop();
	pool.shutdown();
	reactor.dispose();
	server.stop();
}
