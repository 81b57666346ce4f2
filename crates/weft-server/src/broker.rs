// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! The broker: wires the fabric envelope protocol onto plain sessions.
//!
//! One handler instance is created per upgraded connection; it registers the
//! session, applies Subscribe/Unsubscribe to the registry, fans Publish out,
//! forwards Request to the pluggable request hook, and honours Logout.

use std::sync::Arc;

use weft_network::protocol::Envelope;
use weft_network::ws::UpgradeRequest;

use crate::{
	handler::{SessionHandler, SessionHandlerFactory},
	registry::TopicRegistry,
	session::StreamSession,
};

/// Application hook for correlated requests. Implementations usually answer
/// with [`StreamSession::reply`] using the same `id`.
pub trait RequestHandler: Send + Sync {
	fn on_request(&self, session: &Arc<StreamSession>, id: &str, topic: &str, body: &str);
}

pub struct Broker {
	registry: Arc<TopicRegistry>,
	requests: Option<Arc<dyn RequestHandler>>,
}

impl Broker {
	pub fn new(registry: Arc<TopicRegistry>) -> Self {
		Self {
			registry,
			requests: None,
		}
	}

	pub fn with_request_handler(mut self, requests: Arc<dyn RequestHandler>) -> Self {
		self.requests = Some(requests);
		self
	}

	pub fn registry(&self) -> &Arc<TopicRegistry> {
		&self.registry
	}
}

impl SessionHandlerFactory for Broker {
	fn create(&self) -> Box<dyn SessionHandler> {
		Box::new(BrokerSessionHandler {
			registry: self.registry.clone(),
			requests: self.requests.clone(),
		})
	}
}

struct BrokerSessionHandler {
	registry: Arc<TopicRegistry>,
	requests: Option<Arc<dyn RequestHandler>>,
}

impl SessionHandler for BrokerSessionHandler {
	fn on_open(&mut self, session: &Arc<StreamSession>, _request: &UpgradeRequest) {
		self.registry.insert_session(session.clone());
		tracing::debug!(session = session.id(), peer = %session.peer(), "fabric session open");
	}

	fn on_message(&mut self, session: &Arc<StreamSession>, text: &str) {
		let envelope = match Envelope::from_json(text) {
			Ok(envelope) => envelope,
			Err(error) => {
				// malformed envelopes do not tear the session down
				tracing::warn!(session = session.id(), %error, "dropping malformed envelope");
				return;
			}
		};

		match envelope {
			Envelope::Subscribe(subscribe) => {
				self.registry.subscribe(session.id(), &subscribe.topic);
			}
			Envelope::Unsubscribe(unsubscribe) => {
				self.registry.unsubscribe(session.id(), &unsubscribe.topic);
			}
			Envelope::Publish(publish) => {
				self.registry.broadcast(&publish.topic, &publish.body);
			}
			Envelope::Request(request) => match &self.requests {
				Some(requests) => {
					requests.on_request(session, &request.id, &request.topic, &request.body)
				}
				None => {
					tracing::debug!(
						session = session.id(),
						topic = %request.topic,
						"no request handler configured, dropping request"
					);
				}
			},
			Envelope::Logout => {
				session.logout();
			}
			Envelope::Reply(_) | Envelope::Data(_) => {
				tracing::debug!(
					session = session.id(),
					"ignoring server-bound reply/data envelope"
				);
			}
		}
	}

	fn on_close(&mut self, session: &Arc<StreamSession>) {
		self.registry.remove_session(session.id());
		tracing::debug!(session = session.id(), "fabric session closed");
	}
}
