// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! The fabric envelope protocol.
//!
//! Envelopes ride as JSON text frames, discriminated by the `type` field:
//! - `"Subscribe"` / `"Unsubscribe"` - topic interest management
//! - `"Publish"` - client-originated fan-out to a topic
//! - `"Request"` / `"Reply"` - correlated exchanges; clients pick the `id`
//! - `"Data"` - server-side fan-out delivery to a subscribed session
//! - `"Logout"` - orderly session end without a transport error

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Envelope {
	Subscribe(SubscribeRequest),
	Unsubscribe(UnsubscribeRequest),
	Publish(PublishMessage),
	Request(RequestMessage),
	Reply(ReplyMessage),
	Data(DataMessage),
	Logout,
}

/// Subscribe the session to a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
	pub topic: String,
}

/// Drop the session's interest in a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
	pub topic: String,
}

/// Fan a message out to every session subscribed to `topic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMessage {
	pub topic: String,
	pub body: String,
}

/// A correlated request; the `id` comes back on the matching [`ReplyMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
	pub id: String,
	pub topic: String,
	pub body: String,
}

/// The reply to a [`RequestMessage`] with the same `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMessage {
	pub id: String,
	pub topic: String,
	pub body: String,
}

/// Server-side delivery of a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
	pub topic: String,
	pub body: String,
}

impl Envelope {
	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}

	pub fn from_json(text: &str) -> serde_json::Result<Self> {
		serde_json::from_str(text)
	}

	pub fn data(topic: impl Into<String>, body: impl Into<String>) -> Self {
		Self::Data(DataMessage {
			topic: topic.into(),
			body: body.into(),
		})
	}

	pub fn reply(
		id: impl Into<String>,
		topic: impl Into<String>,
		body: impl Into<String>,
	) -> Self {
		Self::Reply(ReplyMessage {
			id: id.into(),
			topic: topic.into(),
			body: body.into(),
		})
	}
}
