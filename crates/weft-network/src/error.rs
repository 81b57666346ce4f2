// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

use crate::ws::{FrameError, HandshakeError};

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Frame(#[from] FrameError),

	#[error(transparent)]
	Handshake(#[from] HandshakeError),

	#[error("connection closed")]
	Closed,
}
