// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

use std::sync::Arc;

use weft_network::{ws::UpgradeRequest, NetworkError};

use crate::session::StreamSession;

/// Callbacks for one server-side session.
///
/// All callbacks run on the session's pool fiber, in posting order: `on_open`
/// first, then message/error callbacks as they arrive, `on_close` exactly
/// once at the end.
pub trait SessionHandler: Send + 'static {
	fn on_open(&mut self, _session: &Arc<StreamSession>, _request: &UpgradeRequest) {}

	fn on_message(&mut self, _session: &Arc<StreamSession>, _text: &str) {}

	fn on_binary_message(&mut self, _session: &Arc<StreamSession>, _data: &[u8]) {}

	/// A protocol violation was observed; the session closes right after.
	fn on_error(&mut self, _session: &Arc<StreamSession>, _reason: &str) {}

	/// A transport failure was observed; the session closes right after.
	fn on_exception(&mut self, _session: &Arc<StreamSession>, _error: &NetworkError) {}

	fn on_close(&mut self, _session: &Arc<StreamSession>) {}
}

/// Creates one handler instance per upgraded connection.
pub trait SessionHandlerFactory: Send + Sync {
	fn create(&self) -> Box<dyn SessionHandler>;
}

impl<F> SessionHandlerFactory for F
where
	F: Fn() -> Box<dyn SessionHandler> + Send + Sync,
{
	fn create(&self) -> Box<dyn SessionHandler> {
		self()
	}
}

/// Sink for transport errors that have no session handler to land on, and
/// for disconnects observed on the send path.
pub trait ErrorHandler: Send + Sync {
	fn on_exception(&self, error: &NetworkError);
}

/// Default error handler: log and move on.
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
	fn on_exception(&self, error: &NetworkError) {
		tracing::error!(%error, "session transport error");
	}
}
