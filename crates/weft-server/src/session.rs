// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! A session: the logical presence above one upgraded connection.
//!
//! Everything that touches the wire goes through the session's send fiber,
//! so heartbeats and data frames interleave without torn writes and publishes
//! to one session are totally ordered by posting order.

use std::{
	collections::HashSet,
	net::SocketAddr,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use weft_core::{PoolFiber, TimerHandle};
use weft_network::{
	protocol::Envelope,
	ws::{close_code, encode_frame, Frame},
	NetworkError, SendResult, Writer,
};

use crate::handler::ErrorHandler;

pub struct StreamSession {
	id: u64,
	peer: SocketAddr,
	writer: Writer,
	send_fiber: PoolFiber,
	subscriptions: Mutex<HashSet<String>>,
	logged_out: AtomicBool,
	heartbeat: Mutex<Option<TimerHandle>>,
	heartbeat_stopped: AtomicBool,
	errors: Arc<dyn ErrorHandler>,
}

impl StreamSession {
	pub(crate) fn new(
		id: u64,
		peer: SocketAddr,
		writer: Writer,
		send_fiber: PoolFiber,
		errors: Arc<dyn ErrorHandler>,
	) -> Arc<Self> {
		Arc::new(Self {
			id,
			peer,
			writer,
			send_fiber,
			subscriptions: Mutex::new(HashSet::new()),
			logged_out: AtomicBool::new(false),
			heartbeat: Mutex::new(None),
			heartbeat_stopped: AtomicBool::new(false),
			errors,
		})
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn peer(&self) -> SocketAddr {
		self.peer
	}

	/// Begin periodic heartbeat pings on the send fiber. No-op when the
	/// interval is zero.
	pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
		if interval.is_zero() || self.heartbeat_stopped.load(Ordering::Acquire) {
			return;
		}
		let session = Arc::clone(self);
		let handle = self
			.send_fiber
			.schedule_with_fixed_delay(interval, interval, move || {
				// a draining or closed writer rejects the ping; close
				// always wins over heartbeats
				let ping = encode_frame(&Frame::ping(Vec::new()), None);
				let _ = session.writer.send(ping);
			});
		*self.heartbeat.lock().unwrap() = Some(handle);
	}

	/// Stop the heartbeat. Dispatches the cancel exactly once no matter how
	/// often it is called.
	pub fn stop_heartbeat(&self) {
		if !self.heartbeat_stopped.swap(true, Ordering::AcqRel) {
			if let Some(handle) = self.heartbeat.lock().unwrap().take() {
				handle.cancel();
			}
		}
	}

	pub fn is_subscribed(&self, topic: &str) -> bool {
		self.subscriptions.lock().unwrap().contains(topic)
	}

	pub fn subscription_count(&self) -> usize {
		self.subscriptions.lock().unwrap().len()
	}

	pub(crate) fn add_subscription(&self, topic: &str) {
		self.subscriptions.lock().unwrap().insert(topic.to_string());
	}

	pub(crate) fn remove_subscription(&self, topic: &str) {
		self.subscriptions.lock().unwrap().remove(topic);
	}

	pub(crate) fn take_subscriptions(&self) -> HashSet<String> {
		std::mem::take(&mut *self.subscriptions.lock().unwrap())
	}

	/// Queue a text frame on the send fiber.
	pub fn send_text(self: &Arc<Self>, text: impl Into<String>) {
		self.send_frame_bytes(encode_frame(&Frame::text(text.into()), None));
	}

	/// Queue pre-encoded frame bytes on the send fiber.
	pub fn send_frame_bytes(self: &Arc<Self>, bytes: Vec<u8>) {
		let session = Arc::clone(self);
		let posted = self.send_fiber.execute(move || {
			if session.writer.send(bytes) == SendResult::Closed {
				session.handle_disconnect();
			}
		});
		if posted.is_err() {
			tracing::debug!(session = self.id, "send fiber rejected write, pool shutting down");
		}
	}

	/// Synchronous send for code already running on the session fiber.
	pub fn try_send_text(&self, text: impl Into<String>) -> SendResult {
		self.writer.send(encode_frame(&Frame::text(text.into()), None))
	}

	/// Deliver `body` on `topic` unconditionally.
	pub fn publish(self: &Arc<Self>, topic: &str, body: &str) {
		match Envelope::data(topic, body).to_json() {
			Ok(json) => self.send_text(json),
			Err(error) => tracing::error!(%error, "failed to encode data envelope"),
		}
	}

	/// Deliver pre-encoded frame bytes iff the session subscribed to `topic`;
	/// dropped silently otherwise.
	pub fn publish_if_subscribed(self: &Arc<Self>, topic: &str, frame: &Arc<Vec<u8>>) {
		if self.is_subscribed(topic) {
			self.send_frame_bytes(frame.as_ref().clone());
		}
	}

	/// Answer a correlated request.
	pub fn reply(self: &Arc<Self>, id: &str, topic: &str, body: &str) {
		match Envelope::reply(id, topic, body).to_json() {
			Ok(json) => self.send_text(json),
			Err(error) => tracing::error!(%error, "failed to encode reply envelope"),
		}
	}

	/// Queue a close frame; the writer flips to draining-only.
	pub fn close(self: &Arc<Self>, code: u16, reason: &str) {
		let session = Arc::clone(self);
		let frame = encode_frame(&Frame::close(code, reason), None);
		let posted = self.send_fiber.execute(move || {
			let _ = session.writer.send_close(frame);
		});
		if posted.is_err() {
			self.writer.mark_closed();
		}
	}

	/// Mark the session logged out: the heartbeat stops and the eventual
	/// disconnect is not surfaced as an error.
	pub fn logout(self: &Arc<Self>) {
		self.logged_out.store(true, Ordering::Release);
		self.stop_heartbeat();
		self.close(close_code::NORMAL, "logout");
	}

	pub fn is_logged_out(&self) -> bool {
		self.logged_out.load(Ordering::Acquire)
	}

	/// Drop the transport immediately. Safe to call more than once.
	pub fn disconnect(&self) {
		self.writer.mark_closed();
	}

	fn handle_disconnect(&self) {
		self.writer.mark_closed();
		if !self.is_logged_out() {
			self.errors.on_exception(&NetworkError::Closed);
		}
	}
}
