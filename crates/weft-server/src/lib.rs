// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! The accepting side of the weft fabric.
//!
//! An [`Acceptor`] listens on a port and round-robins new connections across
//! a pool of reader reactors. Each upgraded connection gets a
//! [`StreamSession`] whose handler callbacks run serialized on a pool fiber.
//! The [`TopicRegistry`] tracks which sessions subscribed to which topics and
//! fans published messages out; the [`Broker`] wires the fabric envelope
//! protocol onto plain sessions.

mod acceptor;
mod broker;
mod config;
mod connection;
mod handler;
mod registry;
mod server;
mod session;

pub use acceptor::{Acceptor, ReaderPool};
pub use broker::{Broker, RequestHandler};
pub use config::{path_eq, ServerConfig};
pub use handler::{ErrorHandler, LoggingErrorHandler, SessionHandler, SessionHandlerFactory};
pub use registry::{RegistryEvent, TopicRegistry};
pub use server::Server;
pub use session::StreamSession;
