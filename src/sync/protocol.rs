//! Wire protocol of the room channels.
//!
//! Sync connections exchange binary Automerge frames. Sharing and
//! permissions connections receive JSON text frames tagged by `type`.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{AuthContext, Collaborator, Role};
use crate::room::{truncate_reason, Outbound};

/// Maximum accepted sync frame (16MB)
pub const MAX_SYNC_FRAME: usize = 16 * 1024 * 1024;

/// WebSocket close codes sent by the server
pub mod close_codes {
    /// Missing or malformed identity metadata
    pub const INVALID_CONTEXT: u16 = 4400;
    pub const UNAUTHORIZED: u16 = 4401;
    /// Access revoked or never granted
    pub const FORBIDDEN: u16 = 4403;
    /// Sharing channel opened by someone other than the owner
    pub const OWNER_ONLY: u16 = 4405;
    pub const INTERNAL: u16 = 4500;
}

/// Capability state of one user on one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionPayload {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub can_view: bool,
    pub can_comment: bool,
    pub can_edit: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&AuthContext> for PermissionPayload {
    fn from(ctx: &AuthContext) -> Self {
        Self {
            document_id: ctx.document_id,
            user_id: ctx.user_id,
            role: ctx.grant.role,
            can_view: ctx.grant.can_view,
            can_comment: ctx.grant.can_comment,
            can_edit: ctx.grant.can_edit,
            updated_at: ctx.grant.updated_at,
        }
    }
}

/// Why a user lost access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    ShareRemoved,
    DocumentDeleted,
    OwnershipTransferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokedPayload {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub reason: RevocationReason,
    pub revoked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CollaboratorUpsert {
    pub document_id: Uuid,
    pub collaborator: Collaborator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CollaboratorRemove {
    pub document_id: Uuid,
    pub user_id: Uuid,
}

/// Sharing-roster event pushed to a document owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CollaboratorEvent {
    #[serde(rename = "collaborator:upsert")]
    Upsert(CollaboratorUpsert),
    #[serde(rename = "collaborator:remove")]
    Remove(CollaboratorRemove),
}

impl CollaboratorEvent {
    pub fn document_id(&self) -> Uuid {
        match self {
            CollaboratorEvent::Upsert(e) => e.document_id,
            CollaboratorEvent::Remove(e) => e.document_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingSnapshot {
    pub document_id: Uuid,
    pub collaborators: Vec<Collaborator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Text frames sent to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "sharing:snapshot")]
    SharingSnapshot(SharingSnapshot),
    #[serde(rename = "permissions:snapshot")]
    PermissionsSnapshot(PermissionPayload),
    #[serde(rename = "permissions:update")]
    PermissionsUpdate(PermissionPayload),
    #[serde(rename = "permissions:revoked")]
    PermissionsRevoked(RevokedPayload),
    #[serde(rename = "collaborator:upsert")]
    CollaboratorUpsert(CollaboratorUpsert),
    #[serde(rename = "collaborator:remove")]
    CollaboratorRemove(CollaboratorRemove),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            code: code.to_string(),
            message: message.into(),
        })
    }

    /// Encode as a text frame
    pub fn to_frame(&self) -> Result<Outbound, serde_json::Error> {
        Ok(Outbound::Text(serde_json::to_string(self)?))
    }
}

impl From<CollaboratorEvent> for ServerMessage {
    fn from(event: CollaboratorEvent) -> Self {
        match event {
            CollaboratorEvent::Upsert(e) => ServerMessage::CollaboratorUpsert(e),
            CollaboratorEvent::Remove(e) => ServerMessage::CollaboratorRemove(e),
        }
    }
}

/// Translate an outbound frame into a WebSocket message
pub fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Text(text) => Message::Text(text),
        Outbound::Binary(bytes) => Message::Binary(bytes.to_vec()),
        Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: truncate_reason(&reason).into(),
        })),
    }
}

/// Send a close frame and drop the socket
pub async fn close_socket(mut socket: WebSocket, code: u16, reason: String) {
    let _ = socket.send(to_message(Outbound::Close { code, reason })).await;
}
