// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! Weft: a bidirectional, topic-oriented messaging fabric over WebSocket.
//!
//! Clients open a long-lived connection, subscribe to topics by name,
//! publish to topics, and issue correlated request/reply exchanges. A
//! broker-style acceptor dispatches connections onto a pool of reader
//! reactors and fans server-side publications out to subscribed sessions
//! only.

use std::time::Duration;

pub use weft_client as client;
pub use weft_core as core;
pub use weft_network as network;
pub use weft_server as server;

pub use weft_client::{ClientConfig, ClientHandle, ClientHandler, FabricClient, FabricEvents, WsClient};
pub use weft_core::{CoreError, PoolFiber, Reactor, ReactorHandle, TimerHandle, WorkerPool};
pub use weft_network::{
	close_code,
	protocol::Envelope,
	Frame, FrameParser, MessageAssembler, NetworkError, Opcode, SendResult,
};
pub use weft_server::{
	path_eq, Acceptor, Broker, ReaderPool, RegistryEvent, RequestHandler, Server, ServerConfig,
	SessionHandler, SessionHandlerFactory, StreamSession, TopicRegistry,
};

/// Default configuration values
pub mod defaults {
	use super::Duration;

	/// Default heartbeat interval (30 seconds)
	pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

	/// Default connect timeout and reconnect delay (5 seconds)
	pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

	/// Default writer high-water mark (1 MiB)
	pub const HIGH_WATER_MARK: usize = 1 << 20;

	/// Default maximum frame payload (16 MiB)
	pub const MAX_FRAME_SIZE: usize = 16 << 20;
}
