// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! The fabric client: envelope protocol over a [`WsClient`].
//!
//! Tracks topic subscriptions (replayed after a reconnect), fans inbound
//! `Data` envelopes to the observer, and correlates `Request`/`Reply`
//! exchanges through a pending map keyed by uuid.

use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex},
	time::Duration,
};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use uuid::Uuid;
use weft_core::{ReactorHandle, WorkerPool};
use weft_network::{
	protocol::{
		Envelope, PublishMessage, ReplyMessage, RequestMessage, SubscribeRequest,
		UnsubscribeRequest,
	},
	ws::UpgradeResponse,
	NetworkError, SendResult,
};

use crate::{
	config::ClientConfig,
	session::{ClientHandle, ClientHandler, WsClient},
};

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
	#[error("no reply within {0:?}")]
	Timeout(Duration),

	#[error("session closed before the reply arrived")]
	Closed,
}

/// Observer for fabric-level events. All callbacks run on the session fiber.
pub trait FabricEvents: Send + 'static {
	fn on_connected(&mut self) {}

	/// A `Data` envelope arrived on a subscribed topic.
	fn on_message(&mut self, _topic: &str, _body: &str) {}

	fn on_closed(&mut self) {}
}

pub struct FabricClient {
	client: WsClient,
	inner: Arc<FabricInner>,
}

struct FabricInner {
	pending: Mutex<HashMap<String, Sender<ReplyMessage>>>,
	topics: Mutex<HashSet<String>>,
}

impl FabricClient {
	pub fn open(
		reactor: &ReactorHandle,
		pool: &WorkerPool,
		host: impl Into<String>,
		port: u16,
		path: impl Into<String>,
		config: ClientConfig,
		events: impl FabricEvents,
	) -> Self {
		let inner = Arc::new(FabricInner {
			pending: Mutex::new(HashMap::new()),
			topics: Mutex::new(HashSet::new()),
		});
		let client = WsClient::open(
			reactor,
			pool,
			host,
			port,
			path,
			config,
			FabricHandler {
				inner: inner.clone(),
				events,
			},
		);
		Self { client, inner }
	}

	pub fn is_open(&self) -> bool {
		self.client.is_open()
	}

	/// Register interest in `topic`. The subscription is replayed after a
	/// reconnect.
	pub fn subscribe(&self, topic: impl Into<String>) -> SendResult {
		let topic = topic.into();
		self.inner.topics.lock().unwrap().insert(topic.clone());
		self.send_envelope(&Envelope::Subscribe(SubscribeRequest {
			topic,
		}))
	}

	pub fn unsubscribe(&self, topic: &str) -> SendResult {
		self.inner.topics.lock().unwrap().remove(topic);
		self.send_envelope(&Envelope::Unsubscribe(UnsubscribeRequest {
			topic: topic.to_string(),
		}))
	}

	/// Fan `body` out to every session subscribed to `topic`.
	pub fn publish(&self, topic: impl Into<String>, body: impl Into<String>) -> SendResult {
		self.send_envelope(&Envelope::Publish(PublishMessage {
			topic: topic.into(),
			body: body.into(),
		}))
	}

	/// Correlated request: blocks until the matching reply or `timeout`.
	pub fn request(
		&self,
		topic: impl Into<String>,
		body: impl Into<String>,
		timeout: Duration,
	) -> Result<ReplyMessage, RequestError> {
		let id = Uuid::new_v4().to_string();
		let (tx, rx) = bounded(1);
		self.inner.pending.lock().unwrap().insert(id.clone(), tx);

		let sent = self.send_envelope(&Envelope::Request(RequestMessage {
			id: id.clone(),
			topic: topic.into(),
			body: body.into(),
		}));
		if sent == SendResult::Closed {
			self.inner.pending.lock().unwrap().remove(&id);
			return Err(RequestError::Closed);
		}

		match rx.recv_timeout(timeout) {
			Ok(reply) => Ok(reply),
			Err(RecvTimeoutError::Timeout) => {
				self.inner.pending.lock().unwrap().remove(&id);
				Err(RequestError::Timeout(timeout))
			}
			Err(RecvTimeoutError::Disconnected) => Err(RequestError::Closed),
		}
	}

	/// Orderly end of session: the server drops the session without
	/// surfacing a transport error.
	pub fn logout(&self) -> SendResult {
		self.send_envelope(&Envelope::Logout)
	}

	pub fn send_close(&self) -> SendResult {
		self.client.send_close()
	}

	pub fn stop(&self) {
		self.client.stop();
	}

	fn send_envelope(&self, envelope: &Envelope) -> SendResult {
		match envelope.to_json() {
			Ok(json) => self.client.send(&json),
			Err(error) => {
				tracing::error!(%error, "failed to encode envelope");
				SendResult::Closed
			}
		}
	}
}

struct FabricHandler<E: FabricEvents> {
	inner: Arc<FabricInner>,
	events: E,
}

impl<E: FabricEvents> ClientHandler for FabricHandler<E> {
	type State = ();

	fn on_open(&mut self, conn: &ClientHandle, _response: &UpgradeResponse) {
		// replay topic interest; matters after a reconnect
		let topics: Vec<String> = self.inner.topics.lock().unwrap().iter().cloned().collect();
		for topic in topics {
			match (Envelope::Subscribe(SubscribeRequest {
				topic,
			}))
			.to_json()
			{
				Ok(json) => {
					let _ = conn.send(&json);
				}
				Err(error) => tracing::error!(%error, "failed to encode subscribe"),
			}
		}
		self.events.on_connected();
	}

	fn on_message(&mut self, _conn: &ClientHandle, _state: &mut Self::State, text: &str) {
		match Envelope::from_json(text) {
			Ok(Envelope::Data(data)) => self.events.on_message(&data.topic, &data.body),
			Ok(Envelope::Reply(reply)) => {
				if let Some(tx) = self.inner.pending.lock().unwrap().remove(&reply.id) {
					let _ = tx.send(reply);
				} else {
					tracing::debug!(id = %reply.id, "reply with no pending request");
				}
			}
			Ok(_) => {
				tracing::debug!("ignoring client-bound envelope");
			}
			Err(error) => {
				tracing::warn!(%error, "dropping malformed envelope");
			}
		}
	}

	fn on_exception(
		&mut self,
		_conn: &ClientHandle,
		_state: Option<&mut Self::State>,
		error: &NetworkError,
	) {
		tracing::debug!(%error, "fabric transport error");
	}

	fn on_close(&mut self, _conn: &ClientHandle, _state: &mut Self::State) {
		// fail outstanding requests; their receivers observe the disconnect
		self.inner.pending.lock().unwrap().clear();
		self.events.on_closed();
	}
}
