// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
	#[error("executor rejected the task: worker pool is shutting down")]
	ExecutorRejected,

	#[error("reactor is shut down")]
	ReactorShutdown,

	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
}
