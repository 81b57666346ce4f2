// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Topic subscription registry: topic → subscribed sessions, plus the
//! per-session reverse index.
//!
//! Both sides of the mapping change under one lock, so for every session S
//! and topic t, `t ∈ S.subs ⇔ S ∈ registry[t]` holds at all times. Subscribe
//! and unsubscribe transitions are announced on an event channel so
//! operators can observe first-subscriber semantics.

use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use weft_network::protocol::Envelope;

use crate::session::StreamSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
	Subscribe {
		topic: String,
		session: u64,
	},
	Unsubscribe {
		topic: String,
	},
}

pub struct TopicRegistry {
	inner: Mutex<Inner>,
	events_tx: Sender<RegistryEvent>,
	events_rx: Receiver<RegistryEvent>,
}

struct Inner {
	topics: HashMap<String, HashSet<u64>>,
	sessions: HashMap<u64, Arc<StreamSession>>,
}

impl Default for TopicRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl TopicRegistry {
	pub fn new() -> Self {
		let (events_tx, events_rx) = unbounded();
		Self {
			inner: Mutex::new(Inner {
				topics: HashMap::new(),
				sessions: HashMap::new(),
			}),
			events_tx,
			events_rx,
		}
	}

	/// Subscribe to the registry's event stream.
	pub fn events(&self) -> Receiver<RegistryEvent> {
		self.events_rx.clone()
	}

	pub fn insert_session(&self, session: Arc<StreamSession>) {
		self.inner
			.lock()
			.unwrap()
			.sessions
			.insert(session.id(), session);
	}

	/// Remove a session, dropping every subscription it held.
	pub fn remove_session(&self, id: u64) {
		let mut inner = self.inner.lock().unwrap();
		let Some(session) = inner.sessions.remove(&id) else {
			return;
		};
		for topic in session.take_subscriptions() {
			if let Some(members) = inner.topics.get_mut(&topic) {
				members.remove(&id);
				if members.is_empty() {
					inner.topics.remove(&topic);
				}
			}
		}
	}

	pub fn subscribe(&self, id: u64, topic: &str) {
		let mut inner = self.inner.lock().unwrap();
		let Some(session) = inner.sessions.get(&id) else {
			return;
		};
		session.add_subscription(topic);
		inner.topics.entry(topic.to_string()).or_default().insert(id);
		let _ = self.events_tx.send(RegistryEvent::Subscribe {
			topic: topic.to_string(),
			session: id,
		});
	}

	pub fn unsubscribe(&self, id: u64, topic: &str) {
		let mut inner = self.inner.lock().unwrap();
		let Some(session) = inner.sessions.get(&id) else {
			return;
		};
		session.remove_subscription(topic);
		if let Some(members) = inner.topics.get_mut(topic) {
			members.remove(&id);
			if members.is_empty() {
				inner.topics.remove(topic);
			}
		}
		let _ = self.events_tx.send(RegistryEvent::Unsubscribe {
			topic: topic.to_string(),
		});
	}

	/// Deliver to one session iff it subscribed to `topic`.
	pub fn publish_to(&self, id: u64, topic: &str, body: &str) {
		let session = self.inner.lock().unwrap().sessions.get(&id).cloned();
		let Some(session) = session else {
			return;
		};
		if let Some(frame) = encode_data(topic, body) {
			session.publish_if_subscribed(topic, &frame);
		}
	}

	/// Encode once, then deliver to every session subscribed to `topic`.
	pub fn broadcast(&self, topic: &str, body: &str) {
		let Some(frame) = encode_data(topic, body) else {
			return;
		};
		let targets: Vec<Arc<StreamSession>> = {
			let inner = self.inner.lock().unwrap();
			match inner.topics.get(topic) {
				Some(members) => members
					.iter()
					.filter_map(|id| inner.sessions.get(id).cloned())
					.collect(),
				None => Vec::new(),
			}
		};
		for session in targets {
			session.publish_if_subscribed(topic, &frame);
		}
	}

	pub fn session_count(&self) -> usize {
		self.inner.lock().unwrap().sessions.len()
	}

	pub fn subscriber_count(&self, topic: &str) -> usize {
		self.inner
			.lock()
			.unwrap()
			.topics
			.get(topic)
			.map_or(0, HashSet::len)
	}
}

fn encode_data(topic: &str, body: &str) -> Option<Arc<Vec<u8>>> {
	use weft_network::ws::{encode_frame, Frame};

	match Envelope::data(topic, body).to_json() {
		Ok(json) => Some(Arc::new(encode_frame(&Frame::text(json), None))),
		Err(error) => {
			tracing::error!(%error, "failed to encode data envelope");
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use std::net::TcpListener;

	use mio::net::TcpStream;
	use weft_core::{PoolFiber, Reactor, WorkerPool};
	use weft_network::Writer;

	use super::*;
	use crate::handler::LoggingErrorHandler;

	struct Fixture {
		reactor: Reactor,
		pool: WorkerPool,
		// keep peers alive so sessions do not observe EOF
		peers: Vec<std::net::TcpStream>,
	}

	impl Fixture {
		fn new() -> Self {
			Self {
				reactor: Reactor::spawn("registry-test").unwrap(),
				pool: WorkerPool::new(2),
				peers: Vec::new(),
			}
		}

		fn session(&mut self, id: u64) -> Arc<StreamSession> {
			let listener = TcpListener::bind("127.0.0.1:0").unwrap();
			let addr = listener.local_addr().unwrap();
			let peer = std::net::TcpStream::connect(addr).unwrap();
			let (accepted, peer_addr) = listener.accept().unwrap();
			accepted.set_nonblocking(true).unwrap();
			self.peers.push(peer);

			let stream = Arc::new(TcpStream::from_std(accepted));
			let writer = Writer::new(stream, self.reactor.handle().clone(), 1 << 20);
			let fiber = PoolFiber::new(self.pool.clone(), self.reactor.handle().clone());
			StreamSession::new(id, peer_addr, writer, fiber, Arc::new(LoggingErrorHandler))
		}
	}

	#[test]
	fn test_membership_invariant_holds_both_ways() {
		let mut fixture = Fixture::new();
		let registry = TopicRegistry::new();
		let session = fixture.session(1);
		registry.insert_session(session.clone());

		registry.subscribe(1, "alpha");
		assert!(session.is_subscribed("alpha"));
		assert_eq!(registry.subscriber_count("alpha"), 1);

		registry.unsubscribe(1, "alpha");
		assert!(!session.is_subscribed("alpha"));
		assert_eq!(registry.subscriber_count("alpha"), 0);
		fixture.pool.shutdown();
	}

	#[test]
	fn test_remove_session_clears_every_topic() {
		let mut fixture = Fixture::new();
		let registry = TopicRegistry::new();
		let session = fixture.session(7);
		registry.insert_session(session.clone());

		registry.subscribe(7, "a");
		registry.subscribe(7, "b");
		registry.remove_session(7);

		assert_eq!(registry.session_count(), 0);
		assert_eq!(registry.subscriber_count("a"), 0);
		assert_eq!(registry.subscriber_count("b"), 0);
		assert_eq!(session.subscription_count(), 0);
		fixture.pool.shutdown();
	}

	#[test]
	fn test_subscribe_and_unsubscribe_emit_events() {
		let mut fixture = Fixture::new();
		let registry = TopicRegistry::new();
		let events = registry.events();
		registry.insert_session(fixture.session(3));

		registry.subscribe(3, "alpha");
		registry.unsubscribe(3, "alpha");

		assert_eq!(
			events.try_recv().unwrap(),
			RegistryEvent::Subscribe {
				topic: "alpha".into(),
				session: 3
			}
		);
		assert_eq!(
			events.try_recv().unwrap(),
			RegistryEvent::Unsubscribe {
				topic: "alpha".into()
			}
		);
		fixture.pool.shutdown();
	}

	#[test]
	fn test_subscribe_unknown_session_is_ignored() {
		let registry = TopicRegistry::new();
		registry.subscribe(99, "ghost");
		assert_eq!(registry.subscriber_count("ghost"), 0);
	}

	#[test]
	fn test_stop_heartbeat_is_idempotent() {
		let mut fixture = Fixture::new();
		let session = fixture.session(1);
		session.start_heartbeat(std::time::Duration::from_secs(5));

		session.stop_heartbeat();
		session.stop_heartbeat();
		session.stop_heartbeat();
		// restarting after stop stays stopped
		session.start_heartbeat(std::time::Duration::from_secs(5));
		fixture.pool.shutdown();
	}
}
