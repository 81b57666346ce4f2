// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! The connecting side of the weft fabric.
//!
//! [`WsClient`] drives one WebSocket session over a reactor: non-blocking
//! connect, upgrade handshake, masked framing, reconnect. [`FabricClient`]
//! layers the envelope protocol on top: topic subscriptions that survive
//! reconnects and correlated request/reply exchanges.

mod config;
mod fabric;
mod session;

pub use config::ClientConfig;
pub use fabric::{FabricClient, FabricEvents, RequestError};
pub use session::{ClientHandle, ClientHandler, WsClient};
