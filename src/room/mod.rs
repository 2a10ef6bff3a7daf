//! Room module for identity parsing, connection multiplexing and channel dispatch.
//!
//! A room is one document seen through one channel:
//! - `doc:<uuid>` or `doc:<uuid>:sync` carries live document sync
//! - `doc:<uuid>:sharing` carries the owner-only collaborator roster
//! - `doc:<uuid>:permissions` carries per-user capability events

pub mod dispatcher;
mod identity;
mod multiplexer;

pub use identity::{parse_room, parse_room_path};
pub use multiplexer::{truncate_reason, CloseOutcome, Connection, ConnectionMultiplexer, Outbound};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Sub-protocol carried by a room, fixed at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Live document collaboration
    Sync,
    /// Owner-only collaborator roster
    Sharing,
    /// Per-user capability broadcast
    Permissions,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Sync, Channel::Sharing, Channel::Permissions];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sync => "sync",
            Channel::Sharing => "sharing",
            Channel::Permissions => "permissions",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "sync" => Some(Channel::Sync),
            "sharing" => Some(Channel::Sharing),
            "permissions" => Some(Channel::Permissions),
            _ => None,
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::Sync
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed identity of a room. Derived per request, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomIdentity {
    pub document_id: Uuid,
    pub channel: Channel,
    /// The canonical room string that matched (`doc:<uuid>[:<channel>]`)
    pub raw_name: String,
}

impl RoomIdentity {
    pub fn key(&self) -> RoomKey {
        RoomKey::new(self.document_id, self.channel)
    }
}

/// Key of a live room in the multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub document_id: Uuid,
    pub channel: Channel,
}

impl RoomKey {
    pub fn new(document_id: Uuid, channel: Channel) -> Self {
        Self {
            document_id,
            channel,
        }
    }

    /// Canonical room name for this key
    pub fn room_name(&self) -> String {
        match self.channel {
            Channel::Sync => format!("doc:{}", self.document_id),
            other => format!("doc:{}:{}", self.document_id, other),
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.room_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_slugs() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_slug(channel.as_str()), Some(channel));
        }
        assert_eq!(Channel::from_slug("presence"), None);
        assert_eq!(Channel::default(), Channel::Sync);
    }

    #[test]
    fn test_room_name_omits_sync_slug() {
        let id = Uuid::new_v4();
        assert_eq!(RoomKey::new(id, Channel::Sync).room_name(), format!("doc:{}", id));
        assert_eq!(
            RoomKey::new(id, Channel::Sharing).to_string(),
            format!("doc:{}:sharing", id)
        );
    }
}
