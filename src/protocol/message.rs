//! Protocol message definitions
//!
//! Command tags and the JSON payloads exchanged between clients and the hub.

use serde::{Deserialize, Serialize};

/// User identifier as sent by clients
pub type UserId = i64;

/// Command carried in the first byte of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client logs in and declares its friend list
    Login,
    /// Client keepalive
    Heartbeat,
    /// Server notifies a client about a friend's online state
    StatusChange,
    /// Any tag outside the known set
    Unknown(u8),
}

impl Command {
    /// Get the wire tag for this command
    pub fn type_id(&self) -> u8 {
        match self {
            Command::Login => 0x01,
            Command::Heartbeat => 0x02,
            Command::StatusChange => 0x03,
            Command::Unknown(tag) => *tag,
        }
    }
}

impl From<u8> for Command {
    fn from(tag: u8) -> Self {
        match tag {
            0x01 => Command::Login,
            0x02 => Command::Heartbeat,
            0x03 => Command::StatusChange,
            other => Command::Unknown(other),
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Command::Unknown(0)
    }
}

/// Login payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub user_id: UserId,
    /// Users this client wants to hear about. Order is kept and
    /// duplicates are not removed.
    #[serde(default)]
    pub friends: Vec<UserId>,
}

/// Heartbeat payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub user_id: UserId,
}

/// Status change notification pushed to friends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangeNotification {
    pub user_id: UserId,
    pub online: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tags() {
        assert_eq!(Command::from(0x01), Command::Login);
        assert_eq!(Command::from(0x02), Command::Heartbeat);
        assert_eq!(Command::from(0x03), Command::StatusChange);
        assert_eq!(Command::from(0x7f), Command::Unknown(0x7f));
        assert_eq!(Command::Unknown(0x7f).type_id(), 0x7f);
        assert_eq!(Command::StatusChange.type_id(), 0x03);
    }

    #[test]
    fn test_login_without_friends_field() {
        let req: LoginRequest = serde_json::from_str(r#"{"user_id":7}"#).unwrap();
        assert_eq!(req.user_id, 7);
        assert!(req.friends.is_empty());
    }

    #[test]
    fn test_friends_keep_duplicates() {
        let req: LoginRequest =
            serde_json::from_str(r#"{"user_id":1, "friends": [3, 2, 3]}"#).unwrap();
        assert_eq!(req.friends, vec![3, 2, 3]);
    }
}
