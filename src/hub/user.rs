//! Registry entry for one logged in user

use std::time::{Duration, Instant};

use crate::network::ConnectionHandle;
use crate::protocol::{LoginRequest, UserId};

#[derive(Debug)]
pub struct User {
    pub id: UserId,
    pub online: bool,
    /// Users to notify when this one changes state. Not necessarily mutual.
    pub friends: Vec<UserId>,
    pub last_heartbeat: Instant,
    /// Owned by this entry; closed by the hub, never by the listener
    conn: ConnectionHandle,
}

impl User {
    pub fn new(request: LoginRequest, conn: ConnectionHandle, last_heartbeat: Instant) -> Self {
        Self {
            id: request.user_id,
            online: true,
            friends: request.friends,
            last_heartbeat,
            conn,
        }
    }

    pub fn conn(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// No heartbeat within `timeout` before `now`
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        match self.last_heartbeat.checked_add(timeout) {
            Some(deadline) => deadline < now,
            None => false,
        }
    }
}
