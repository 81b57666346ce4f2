// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Subscribe/publish fan-out through the broker: both subscribers receive a
//! broadcast exactly once; after one unsubscribes, only the other receives.

use std::sync::Arc;

use weft::{
	path_eq, Broker, ClientConfig, FabricClient, FabricEvents, Reactor, RegistryEvent, Server,
	ServerConfig, SessionHandlerFactory, TopicRegistry, WorkerPool,
};
use weft_testing::{busy_wait, EventSink};

struct TopicProbe {
	messages: Arc<EventSink<(String, String)>>,
}

impl FabricEvents for TopicProbe {
	fn on_message(&mut self, topic: &str, body: &str) {
		self.messages.push((topic.to_string(), body.to_string()));
	}
}

struct Fabric {
	registry: Arc<TopicRegistry>,
	server: Server,
	reactor: Reactor,
	pool: WorkerPool,
}

impl Fabric {
	fn start() -> Self {
		let registry = Arc::new(TopicRegistry::new());
		let broker: Arc<dyn SessionHandlerFactory> =
			Arc::new(Broker::new(registry.clone()));
		let server =
			Server::start(0, ServerConfig::new().add(path_eq("/fabric"), broker)).unwrap();
		Self {
			registry,
			server,
			reactor: Reactor::spawn("pubsub-client").unwrap(),
			pool: WorkerPool::new(2),
		}
	}

	fn client(&self, seed: u64, messages: &Arc<EventSink<(String, String)>>) -> FabricClient {
		let client = FabricClient::open(
			self.reactor.handle(),
			&self.pool,
			"127.0.0.1",
			self.server.local_addr().port(),
			"/fabric",
			ClientConfig::new().reconnect(false).mask_seed(seed),
			TopicProbe {
				messages: messages.clone(),
			},
		);
		busy_wait(|| client.is_open().then_some(()));
		client
	}

	fn stop(self) {
		self.pool.shutdown();
		self.reactor.dispose();
		self.server.stop();
	}
}

#[test]
fn test_broadcast_fans_out_and_unsubscribe_narrows() {
	let fabric = Fabric::start();
	let events = fabric.registry.events();

	let a_messages = Arc::new(EventSink::new());
	let b_messages = Arc::new(EventSink::new());
	let a = fabric.client(0xA, &a_messages);
	let b = fabric.client(0xB, &b_messages);

	a.subscribe("t");
	b.subscribe("t");
	busy_wait(|| (fabric.registry.subscriber_count("t") == 2).then_some(()));

	// registry announced both subscriptions
	let first = events.recv().unwrap();
	assert!(matches!(first, RegistryEvent::Subscribe { ref topic, .. } if topic == "t"));
	let second = events.recv().unwrap();
	assert!(matches!(second, RegistryEvent::Subscribe { ref topic, .. } if topic == "t"));

	// server-side broadcast reaches both exactly once
	fabric.registry.broadcast("t", "m");
	a_messages.wait_for(1);
	b_messages.wait_for(1);
	assert_eq!(a_messages.snapshot(), vec![("t".to_string(), "m".to_string())]);
	assert_eq!(b_messages.snapshot(), vec![("t".to_string(), "m".to_string())]);

	// after A unsubscribes, only B receives
	a.unsubscribe("t");
	busy_wait(|| (fabric.registry.subscriber_count("t") == 1).then_some(()));
	fabric.registry.broadcast("t", "m2");
	b_messages.wait_for(2);
	std::thread::sleep(std::time::Duration::from_millis(100));
	assert_eq!(a_messages.count(), 1, "unsubscribed session still received");
	assert_eq!(
		b_messages.snapshot()[1],
		("t".to_string(), "m2".to_string())
	);

	// client-originated publish fans out the same way
	a.publish("t", "from-a");
	b_messages.wait_for(3);
	assert_eq!(
		b_messages.snapshot()[2],
		("t".to_string(), "from-a".to_string())
	);

	a.stop();
	b.stop();
	fabric.stop();
}

#[test]
fn test_logout_removes_the_session_without_error() {
	let fabric = Fabric::start();

	let messages = Arc::new(EventSink::new());
	let client = fabric.client(0xC, &messages);
	client.subscribe("t");
	busy_wait(|| (fabric.registry.session_count() == 1).then_some(()));

	client.logout();
	busy_wait(|| (fabric.registry.session_count() == 0).then_some(()));
	assert_eq!(fabric.registry.subscriber_count("t"), 0);

	fabric.stop();
}
