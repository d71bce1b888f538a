//! Events handed from the listeners to the hub loop

use std::time::Instant;

use crate::network::ConnectionHandle;
use crate::protocol::{LoginRequest, UserId};

/// A client logged in over `conn`
#[derive(Debug)]
pub struct LoginEvent {
    pub request: LoginRequest,
    pub conn: ConnectionHandle,
}

/// A heartbeat arrived for `user_id`
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatEvent {
    pub user_id: UserId,
    /// When the listener received it
    pub at: Instant,
}
