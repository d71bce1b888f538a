//! Protocol module - Defines the wire protocol for FriendHub communication
//!
//! Every message has the same shape on both transports:
//! - 1 byte command tag
//! - JSON payload (never contains a raw newline)
//! - 1 byte `\n` terminator
//!
//! TCP connections are split into messages at `\n` boundaries; a UDP
//! datagram always carries exactly one message.

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Default port for FriendHub communication
pub const DEFAULT_PORT: u16 = 8080;

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65507;
