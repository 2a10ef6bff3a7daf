//! Connection multiplexer for targeted unicast and forced closes.
//!
//! Every live socket is registered here at handshake with fixed identity
//! attributes and a set of tags (`user:<id>`, `role:<role>`). Targeted
//! delivery looks connections up through the tag index first and falls back
//! to a linear scan over each connection's state record when the tag set
//! comes back empty.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Channel, RoomKey};
use crate::auth::{AuthContext, Role};

/// Maximum close reason length allowed by the WebSocket protocol
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// A frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

/// Identity record captured at handshake, immutable for the connection lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub user_id: Option<Uuid>,
    pub role: Option<Role>,
    pub document_id: Uuid,
    pub channel: Channel,
}

/// A live connection owned by the multiplexer
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    state: ConnectionState,
    tags: HashSet<String>,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(state: ConnectionState, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        let mut tags = HashSet::new();
        if let Some(user_id) = state.user_id {
            tags.insert(user_tag(user_id));
        }
        if let Some(role) = state.role {
            tags.insert(format!("role:{}", role.as_str()));
        }

        Self {
            id: Uuid::new_v4(),
            state,
            tags,
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Build a connection from the gateway-injected context
    pub fn from_context(ctx: &AuthContext, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self::new(
            ConnectionState {
                user_id: Some(ctx.user_id),
                role: Some(ctx.grant.role),
                document_id: ctx.document_id,
                channel: ctx.channel,
            },
            tx,
        )
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.state.user_id
    }

    pub fn room_key(&self) -> RoomKey {
        RoomKey::new(self.state.document_id, self.state.channel)
    }

    pub fn tags(&self) -> &HashSet<String> {
        &self.tags
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a frame. Returns false once the connection is closed or its writer is gone.
    pub fn send(&self, frame: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(frame).is_ok()
    }

    /// Close exactly once; later calls are no-ops returning false
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: truncate_reason(reason),
        });
        true
    }
}

fn user_tag(user_id: Uuid) -> String {
    format!("user:{}", user_id)
}

/// Truncate on a char boundary to fit a close frame
pub fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Result of a forced close across several users
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseOutcome {
    /// Connections closed through the tag index
    pub primary: usize,
    /// Connections closed through the linear scan
    pub fallback: usize,
}

impl CloseOutcome {
    pub fn total(&self) -> usize {
        self.primary + self.fallback
    }
}

/// Connections of one room plus their tag index
#[derive(Default)]
struct RoomConnections {
    connections: DashMap<Uuid, Arc<Connection>>,
    tag_index: DashMap<String, HashSet<Uuid>>,
}

impl RoomConnections {
    fn tagged(&self, tag: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<Uuid> = self
            .tag_index
            .get(tag)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        ids.into_iter()
            .filter_map(|id| self.connections.get(&id).map(|c| c.clone()))
            .collect()
    }

    fn scan_user(&self, user_id: Uuid) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().state().user_id == Some(user_id))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Primary tag lookup, linear scan when the tag set is empty
    fn resolve_user(&self, user_id: Uuid) -> (Vec<Arc<Connection>>, bool) {
        let tagged = self.tagged(&user_tag(user_id));
        if !tagged.is_empty() {
            return (tagged, false);
        }
        (self.scan_user(user_id), true)
    }
}

/// Registry of every live connection, grouped by room
#[derive(Default)]
pub struct ConnectionMultiplexer {
    rooms: DashMap<RoomKey, Arc<RoomConnections>>,
}

impl ConnectionMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection at handshake and index its tags
    pub fn register(&self, connection: Arc<Connection>) {
        let key = connection.room_key();
        // Hold the room entry so a concurrent unregister cannot drop it mid-insert
        let room = self.rooms.entry(key).or_default();

        room.connections.insert(connection.id, connection.clone());
        for tag in connection.tags() {
            room.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(connection.id);
        }
        drop(room);

        debug!(
            "Connection {} registered in {} with tags {:?}",
            connection.id,
            key,
            connection.tags()
        );
    }

    /// Remove a connection; drops the room entry once empty
    pub fn unregister(&self, key: &RoomKey, connection_id: Uuid) {
        let Some(room) = self.rooms.get(key).map(|r| r.clone()) else {
            return;
        };

        if let Some((_, connection)) = room.connections.remove(&connection_id) {
            for tag in connection.tags() {
                if let Some(mut ids) = room.tag_index.get_mut(tag) {
                    ids.remove(&connection_id);
                }
                room.tag_index.remove_if(tag, |_, ids| ids.is_empty());
            }
        }

        self.rooms
            .remove_if(key, |_, room| room.connections.is_empty());
    }

    /// All connections currently in a room
    pub fn connections(&self, key: &RoomKey) -> Vec<Arc<Connection>> {
        self.rooms
            .get(key)
            .map(|room| room.connections.iter().map(|c| c.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Send to every connection in a room except `exclude`
    pub fn broadcast(&self, key: &RoomKey, frame: &Outbound, exclude: Option<Uuid>) -> usize {
        self.connections(key)
            .into_iter()
            .filter(|c| Some(c.id) != exclude)
            .filter(|c| c.send(frame.clone()))
            .count()
    }

    /// Deliver a frame to every connection of one user in one room.
    ///
    /// Returns the number of connections reached; zero means the user is
    /// currently offline in this room.
    pub fn send_to_user(&self, key: &RoomKey, user_id: Uuid, frame: &Outbound) -> usize {
        let Some(room) = self.rooms.get(key).map(|r| r.clone()) else {
            return 0;
        };

        let (targets, used_fallback) = room.resolve_user(user_id);
        if used_fallback && !targets.is_empty() {
            debug!("Tag lookup empty for user {} in {}, used scan", user_id, key);
        }

        let mut reached = HashSet::new();
        targets
            .into_iter()
            .filter(|c| reached.insert(c.id))
            .filter(|c| c.send(frame.clone()))
            .count()
    }

    /// Force-close every connection of the given users in one room.
    ///
    /// A connection matching several requested users is closed once.
    pub fn close_users(&self, key: &RoomKey, user_ids: &[Uuid], code: u16, reason: &str) -> CloseOutcome {
        let mut outcome = CloseOutcome::default();
        let Some(room) = self.rooms.get(key).map(|r| r.clone()) else {
            return outcome;
        };

        let mut seen_users = HashSet::new();
        let mut closed = HashSet::new();
        for user_id in user_ids.iter().copied().filter(|u| seen_users.insert(*u)) {
            let (targets, used_fallback) = room.resolve_user(user_id);
            for connection in targets {
                if !closed.insert(connection.id) {
                    continue;
                }
                if connection.close(code, reason) {
                    if used_fallback {
                        outcome.fallback += 1;
                    } else {
                        outcome.primary += 1;
                    }
                }
            }
        }

        if outcome.total() > 0 {
            info!(
                "Closed {} connection(s) in {} (primary={}, fallback={}, code={})",
                outcome.total(),
                key,
                outcome.primary,
                outcome.fallback,
                code
            );
        }
        outcome
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.rooms.iter().map(|r| r.connections.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(
        mux: &ConnectionMultiplexer,
        key: RoomKey,
        user_id: Uuid,
        role: Role,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection::new(
            ConnectionState {
                user_id: Some(user_id),
                role: Some(role),
                document_id: key.document_id,
                channel: key.channel,
            },
            tx,
        ));
        mux.register(connection.clone());
        (connection, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_connection_tags() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let user = Uuid::new_v4();
        let connection = Connection::new(
            ConnectionState {
                user_id: Some(user),
                role: Some(Role::Editor),
                document_id: Uuid::new_v4(),
                channel: Channel::Sync,
            },
            tx,
        );
        assert!(connection.tags().contains(&format!("user:{}", user)));
        assert!(connection.tags().contains("role:editor"));
    }

    #[test]
    fn test_send_to_user_counts_connections() {
        let mux = ConnectionMultiplexer::new();
        let key = RoomKey::new(Uuid::new_v4(), Channel::Permissions);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (_a1, mut rx_a1) = connect(&mux, key, alice, Role::Owner);
        let (_a2, mut rx_a2) = connect(&mux, key, alice, Role::Owner);
        let (_b, mut rx_b) = connect(&mux, key, bob, Role::Viewer);

        let frame = Outbound::Text("hello".into());
        assert_eq!(mux.send_to_user(&key, alice, &frame), 2);
        assert_eq!(drain(&mut rx_a1), vec![frame.clone()]);
        assert_eq!(drain(&mut rx_a2), vec![frame]);
        assert!(drain(&mut rx_b).is_empty());

        assert_eq!(mux.send_to_user(&key, Uuid::new_v4(), &Outbound::Text("x".into())), 0);
    }

    #[test]
    fn test_send_to_user_falls_back_to_scan() {
        let mux = ConnectionMultiplexer::new();
        let key = RoomKey::new(Uuid::new_v4(), Channel::Permissions);
        let user = Uuid::new_v4();
        let (_c, mut rx) = connect(&mux, key, user, Role::Viewer);

        // Simulate lost tag propagation
        mux.rooms.get(&key).unwrap().tag_index.clear();

        let frame = Outbound::Text("update".into());
        assert_eq!(mux.send_to_user(&key, user, &frame), 1);
        assert_eq!(drain(&mut rx), vec![frame]);
    }

    #[test]
    fn test_send_to_user_delivers_once_per_connection() {
        let mux = ConnectionMultiplexer::new();
        let key = RoomKey::new(Uuid::new_v4(), Channel::Sync);
        let user = Uuid::new_v4();
        let (_connection, mut rx) = connect(&mux, key, user, Role::Editor);

        // Tagged and matched by the scan alike, still one frame
        assert_eq!(mux.send_to_user(&key, user, &Outbound::Text("one".into())), 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_close_users_dedupes_and_splits_counts() {
        let mux = ConnectionMultiplexer::new();
        let key = RoomKey::new(Uuid::new_v4(), Channel::Sync);
        let owner = Uuid::new_v4();
        let viewer = Uuid::new_v4();
        let untagged = Uuid::new_v4();

        let (_o, mut rx_owner) = connect(&mux, key, owner, Role::Owner);
        let (_v, mut rx_viewer) = connect(&mux, key, viewer, Role::Viewer);
        let (_u, mut rx_untagged) = connect(&mux, key, untagged, Role::Viewer);
        mux.rooms
            .get(&key)
            .unwrap()
            .tag_index
            .remove(&format!("user:{}", untagged));

        let outcome = mux.close_users(&key, &[viewer, viewer, untagged], 4403, "revoked");
        assert_eq!(outcome, CloseOutcome { primary: 1, fallback: 1 });

        assert_eq!(
            drain(&mut rx_viewer),
            vec![Outbound::Close { code: 4403, reason: "revoked".into() }]
        );
        assert_eq!(drain(&mut rx_untagged).len(), 1);
        assert!(drain(&mut rx_owner).is_empty());

        // Already closed connections are not closed again
        let again = mux.close_users(&key, &[viewer], 4403, "revoked");
        assert_eq!(again.total(), 0);
    }

    #[test]
    fn test_unregister_drops_empty_room() {
        let mux = ConnectionMultiplexer::new();
        let key = RoomKey::new(Uuid::new_v4(), Channel::Sharing);
        let (connection, _rx) = connect(&mux, key, Uuid::new_v4(), Role::Owner);

        assert_eq!(mux.room_count(), 1);
        assert_eq!(mux.connection_count(), 1);
        mux.unregister(&key, connection.id);
        assert_eq!(mux.room_count(), 0);
        assert_eq!(mux.send_to_user(&key, connection.user_id().unwrap(), &Outbound::Text("x".into())), 0);
    }

    #[test]
    fn test_truncate_reason_respects_char_boundary() {
        let reason = "é".repeat(100);
        let truncated = truncate_reason(&reason);
        assert!(truncated.len() <= MAX_CLOSE_REASON_BYTES);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
