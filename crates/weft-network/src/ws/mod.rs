// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Weft Authors

//! WebSocket protocol support: framing, message assembly, and the HTTP
//! upgrade handshake.

mod assembler;
mod frame;
mod handshake;

pub use assembler::{MessageAssembler, WsEvent};
pub use frame::{encode_frame, Frame, FrameError, FrameParser, Opcode};
pub use handshake::{
	accept_key, build_accept_response, build_reject_response, build_upgrade_request,
	find_header_end, generate_key, parse_upgrade_request, parse_upgrade_response,
	HandshakeError, UpgradeRequest, UpgradeResponse,
};

/// Close codes used on the wire (RFC 6455 §7.4.1).
pub mod close_code {
	pub const NORMAL: u16 = 1000;
	pub const GOING_AWAY: u16 = 1001;
	pub const PROTOCOL_ERROR: u16 = 1002;
	pub const INVALID_PAYLOAD: u16 = 1007;
	pub const TOO_BIG: u16 = 1009;
	pub const INTERNAL: u16 = 1011;
}
