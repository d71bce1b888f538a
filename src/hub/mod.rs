//! Presence hub
//!
//! The hub owns the registry of online users. Nothing else ever touches it:
//! listeners hand over login and heartbeat events through bounded queues and
//! a single loop applies them one at a time, together with periodic liveness
//! checks.
//!
//! ```text
//! listener ──► HubHandle::handle ──► login / heartbeat queue ──┐
//!                                                             ├──► Hub::run ──► friends' connections
//!                              tick source (interval) ─────────┘
//! ```

mod events;
mod user;

pub use events::*;
pub use user::*;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::network::{ConnectionError, ConnectionHandle, MessageHandler};
use crate::protocol::{
    encode, CodecError, Command, HeartbeatRequest, LoginRequest, Message,
    StatusChangeNotification, UserId,
};

/// How often stale users are looked for
pub const CHECK_USERS_INTERVAL: Duration = Duration::from_millis(300);

/// Heartbeat silence after which a user is considered offline. New users get
/// the same amount of time on top before their first heartbeat is due.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Capacity of each event queue
pub const QUEUE_CAPACITY: usize = 10;

/// Shortest accepted check period; `tokio::time::interval` panics on zero
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Longest accepted heartbeat timeout
pub const MAX_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Hub errors
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Unexpected command: {0:#04x}")]
    UnexpectedCommand(u8),

    #[error("Hub is not running")]
    Stopped,
}

pub type HubResult<T> = Result<T, HubError>;

/// Hub timing and queue settings
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub check_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            check_interval: CHECK_USERS_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            queue_capacity: QUEUE_CAPACITY,
        }
    }
}

/// Owner of the user registry
pub struct Hub {
    config: HubConfig,
    users: HashMap<UserId, User>,
    login_rx: mpsc::Receiver<LoginEvent>,
    heartbeat_rx: mpsc::Receiver<HeartbeatEvent>,
}

/// Cloneable entry point used by listeners to reach the hub
#[derive(Clone)]
pub struct HubHandle {
    login_tx: mpsc::Sender<LoginEvent>,
    heartbeat_tx: mpsc::Sender<HeartbeatEvent>,
}

impl Hub {
    /// Create a hub and the handle feeding it
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let capacity = config.queue_capacity.max(1);
        let (login_tx, login_rx) = mpsc::channel(capacity);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(capacity);

        let hub = Self {
            config,
            users: HashMap::new(),
            login_rx,
            heartbeat_rx,
        };
        (hub, HubHandle { login_tx, heartbeat_tx })
    }

    /// Process events until `shutdown` fires (or its sender is dropped),
    /// then hand the hub back. Events still queued are left undrained.
    pub async fn run(
        mut self,
        mut ticks: mpsc::Receiver<Instant>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Self {
        loop {
            tokio::select! {
                Some(event) = self.login_rx.recv() => {
                    if let Err(e) = self.handle_login(event, Instant::now()).await {
                        tracing::error!("Could not handle login: {}", e);
                    }
                }
                Some(event) = self.heartbeat_rx.recv() => {
                    if let Err(e) = self.handle_heartbeat(event) {
                        tracing::error!("Could not handle heartbeat: {}", e);
                    }
                }
                Some(now) = ticks.recv() => {
                    self.check_users(now).await;
                }
                _ = &mut shutdown => {
                    tracing::debug!("Hub shutdown requested");
                    break;
                }
            }
        }

        self
    }

    /// Read-only view of the registry
    pub fn users(&self) -> &HashMap<UserId, User> {
        &self.users
    }

    #[cfg(test)]
    pub fn user(&self, user_id: UserId) -> Option<&User> {
        self.users.get(&user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    async fn handle_login(&mut self, event: LoginEvent, now: Instant) -> HubResult<()> {
        let LoginEvent { request, conn } = event;
        tracing::info!(
            user = request.user_id,
            friends = ?request.friends,
            peer = %conn.peer_addr(),
            exclusive = conn.is_exclusive(),
            "User connected"
        );

        // The previous entry's connection goes away before the new one is
        // installed, unless the client logged in again over the same one.
        if let Some(previous) = self.users.remove(&request.user_id) {
            if !previous.conn().same_connection(&conn) {
                if let Err(e) = previous.conn().close().await {
                    tracing::warn!(user = previous.id, "Could not close replaced connection: {}", e);
                }
            }
        }

        let grace = now.checked_add(self.config.heartbeat_timeout).unwrap_or(now);
        let user = User::new(request, conn, grace);
        let user_id = user.id;
        self.users.insert(user_id, user);

        notify_friends(&self.users, user_id, true).await
    }

    fn handle_heartbeat(&mut self, event: HeartbeatEvent) -> HubResult<()> {
        let user = self
            .users
            .get_mut(&event.user_id)
            .ok_or(HubError::UserNotFound(event.user_id))?;
        user.last_heartbeat = event.at;
        Ok(())
    }

    /// Liveness sweep. First every stale user is marked offline and its
    /// connection closed, then each offline user's friends are told and the
    /// user is dropped. Two friends going stale in the same sweep do not
    /// hear about each other.
    async fn check_users(&mut self, now: Instant) {
        let timeout = self.config.heartbeat_timeout;

        for user in self.users.values_mut() {
            if user.online && user.is_stale(now, timeout) {
                tracing::info!(user = user.id, "User disconnected");
                user.online = false;
                if let Err(e) = user.conn().close().await {
                    tracing::error!(user = user.id, "Could not close client connection: {}", e);
                }
            }
        }

        let offline: Vec<UserId> = self
            .users
            .values()
            .filter(|u| !u.online)
            .map(|u| u.id)
            .collect();

        for user_id in offline {
            if let Err(e) = notify_friends(&self.users, user_id, false).await {
                tracing::error!(user = user_id, "Could not notify friends: {}", e);
            }
            self.users.remove(&user_id);
        }
    }
}

/// Tell every registered, online friend of `user_id` about its new state.
/// Only the last write failure is returned; earlier ones are just logged.
async fn notify_friends(
    users: &HashMap<UserId, User>,
    user_id: UserId,
    online: bool,
) -> HubResult<()> {
    let user = users.get(&user_id).ok_or(HubError::UserNotFound(user_id))?;

    let status = StatusChangeNotification { user_id, online };
    let message = encode(Command::StatusChange, &status)?;

    let mut last_error = None;
    for friend_id in &user.friends {
        let Some(friend) = users.get(friend_id).filter(|f| f.online) else {
            continue;
        };

        if let Err(e) = friend.conn().write(&message).await {
            tracing::debug!(user = user_id, friend = *friend_id, "Notification write failed: {}", e);
            last_error = Some(e);
        }
    }

    match last_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

impl HubHandle {
    /// Turn a wire message into a hub event. Waits while the target queue
    /// is full.
    async fn dispatch(&self, conn: ConnectionHandle, message: Message) -> HubResult<()> {
        match message.command {
            Command::Login => {
                let request: LoginRequest = message.parse()?;
                self.login_tx
                    .send(LoginEvent { request, conn })
                    .await
                    .map_err(|_| HubError::Stopped)
            }
            Command::Heartbeat => {
                let request: HeartbeatRequest = message.parse()?;
                self.heartbeat_tx
                    .send(HeartbeatEvent {
                        user_id: request.user_id,
                        at: Instant::now(),
                    })
                    .await
                    .map_err(|_| HubError::Stopped)
            }
            Command::StatusChange | Command::Unknown(_) => {
                Err(HubError::UnexpectedCommand(message.command.type_id()))
            }
        }
    }
}

#[async_trait]
impl MessageHandler for HubHandle {
    async fn handle(&self, conn: ConnectionHandle, message: Message) {
        let peer = conn.peer_addr();
        if let Err(e) = self.dispatch(conn, message).await {
            tracing::error!("Dropping message from {}: {}", peer, e);
        }
    }
}

/// Feed the current time into a channel every `period`. Ticks are dropped
/// while the previous one is still waiting to be picked up.
pub fn spawn_ticker(period: Duration) -> mpsc::Receiver<Instant> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(MIN_CHECK_INTERVAL));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match tx.try_send(Instant::now()) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => break,
            }
        }
    });

    rx
}
