//! Operator endpoints that push targeted events through the multiplexer.
//!
//! Every action answers with the exact number of connections reached.
//! Zero is a valid outcome and means the target is offline.

use axum::http::{HeaderMap, Method};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{AdminAuth, PermissionResolver, Role};
use crate::db::DbError;
use crate::error::ServiceError;
use crate::room::{parse_room_path, Channel, ConnectionMultiplexer, RoomIdentity, RoomKey};
use crate::sync::protocol::{
    close_codes, CollaboratorEvent, PermissionPayload, RevocationReason, RevokedPayload, ServerMessage,
};

/// Upper bound on users closed by one revoke call
pub const MAX_REVOKE_USERS: usize = 100;
const DEFAULT_REVOKE_REASON: &str = "access revoked";

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("admin endpoints only accept POST")]
    MethodNotAllowed,

    #[error("unknown admin action: {0}")]
    UnknownAction(String),

    #[error("invalid admin token")]
    Unauthorized,

    #[error("invalid room: {0}")]
    InvalidRoom(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("documentId does not match room")]
    DocumentMismatch,

    #[error("document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] DbError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<AdminError> for ServiceError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::MethodNotAllowed => ServiceError::MethodNotAllowed,
            AdminError::UnknownAction(_) | AdminError::DocumentNotFound(_) => ServiceError::NotFound(err.to_string()),
            AdminError::Unauthorized => ServiceError::Forbidden(err.to_string()),
            AdminError::InvalidRoom(_) | AdminError::InvalidPayload(_) | AdminError::DocumentMismatch => {
                ServiceError::BadRequest(err.to_string())
            }
            AdminError::Store(_) | AdminError::Encode(_) => ServiceError::Internal(err.to_string()),
        }
    }
}

/// Admin actions addressed by the last path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Revoke,
    PermissionsUpdate,
    AccessRevoked,
    CollaboratorEvent,
}

impl AdminAction {
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "revoke" => Some(AdminAction::Revoke),
            "permissions-update" => Some(AdminAction::PermissionsUpdate),
            "access-revoked" => Some(AdminAction::AccessRevoked),
            "collaborator-event" => Some(AdminAction::CollaboratorEvent),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RevokeRequest {
    document_id: Uuid,
    user_ids: Vec<Uuid>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PermissionsUpdateRequest {
    document_id: Uuid,
    user_id: Uuid,
    role: Role,
    can_view: bool,
    can_comment: bool,
    can_edit: bool,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AccessRevokedRequest {
    document_id: Uuid,
    user_id: Uuid,
    reason: RevocationReason,
    revoked_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CollaboratorEventRequest {
    document_id: Uuid,
    event: CollaboratorEvent,
}

/// Admin control plane over the live connection registry
#[derive(Clone)]
pub struct AdminPlane {
    auth: Arc<AdminAuth>,
    multiplexer: Arc<ConnectionMultiplexer>,
    resolver: PermissionResolver,
}

impl AdminPlane {
    pub fn new(auth: AdminAuth, multiplexer: Arc<ConnectionMultiplexer>, resolver: PermissionResolver) -> Self {
        Self {
            auth: Arc::new(auth),
            multiplexer,
            resolver,
        }
    }

    /// Run one admin request: method, action, token, room, then payload.
    ///
    /// `path` is the raw, still percent-encoded request path; the room
    /// segment inside it is decoded exactly once.
    pub async fn handle(
        &self,
        method: &Method,
        headers: &HeaderMap,
        path: &str,
        action: &str,
        body: &[u8],
    ) -> Result<Value, AdminError> {
        if method != Method::POST {
            return Err(AdminError::MethodNotAllowed);
        }
        let action = AdminAction::from_slug(action).ok_or_else(|| AdminError::UnknownAction(action.to_string()))?;
        if !self.auth.authorize(headers) {
            warn!("Rejected admin {:?} on {}: bad token", action, path);
            return Err(AdminError::Unauthorized);
        }
        let identity = parse_room_path(path).ok_or_else(|| AdminError::InvalidRoom(path.to_string()))?;

        match action {
            AdminAction::Revoke => self.revoke(&identity, parse_body(body)?),
            AdminAction::PermissionsUpdate => self.permissions_update(&identity, parse_body(body)?),
            AdminAction::AccessRevoked => self.access_revoked(&identity, parse_body(body)?),
            AdminAction::CollaboratorEvent => self.collaborator_event(&identity, parse_body(body)?).await,
        }
    }

    fn revoke(&self, room: &RoomIdentity, req: RevokeRequest) -> Result<Value, AdminError> {
        check_document(room, req.document_id)?;
        if req.user_ids.is_empty() || req.user_ids.len() > MAX_REVOKE_USERS {
            return Err(AdminError::InvalidPayload(format!(
                "userIds must hold between 1 and {} ids",
                MAX_REVOKE_USERS
            )));
        }
        let reason = req
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REVOKE_REASON);

        let (mut primary, mut fallback) = (0, 0);
        for channel in Channel::ALL {
            let key = RoomKey::new(room.document_id, channel);
            let outcome = self
                .multiplexer
                .close_users(&key, &req.user_ids, close_codes::FORBIDDEN, reason);
            primary += outcome.primary;
            fallback += outcome.fallback;
        }

        info!(
            document_id = %room.document_id,
            users = req.user_ids.len(),
            closed = primary + fallback,
            "Admin revoke"
        );
        Ok(json!({
            "success": true,
            "documentId": room.document_id,
            "room": room.raw_name,
            "users": req.user_ids.len(),
            "closedConnections": primary + fallback,
            "primaryClosed": primary,
            "fallbackClosed": fallback,
        }))
    }

    fn permissions_update(&self, room: &RoomIdentity, req: PermissionsUpdateRequest) -> Result<Value, AdminError> {
        check_document(room, req.document_id)?;
        let message = ServerMessage::PermissionsUpdate(PermissionPayload {
            document_id: req.document_id,
            user_id: req.user_id,
            role: req.role,
            can_view: req.can_view,
            can_comment: req.can_comment,
            can_edit: req.can_edit,
            updated_at: req.updated_at,
        });
        let delivered = self.unicast(room.document_id, Channel::Permissions, req.user_id, &message)?;
        Ok(delivery(room, delivered))
    }

    fn access_revoked(&self, room: &RoomIdentity, req: AccessRevokedRequest) -> Result<Value, AdminError> {
        check_document(room, req.document_id)?;
        let message = ServerMessage::PermissionsRevoked(RevokedPayload {
            document_id: req.document_id,
            user_id: req.user_id,
            reason: req.reason,
            revoked_at: req.revoked_at,
        });
        let delivered = self.unicast(room.document_id, Channel::Permissions, req.user_id, &message)?;
        Ok(delivery(room, delivered))
    }

    async fn collaborator_event(&self, room: &RoomIdentity, req: CollaboratorEventRequest) -> Result<Value, AdminError> {
        check_document(room, req.document_id)?;
        if req.event.document_id() != req.document_id {
            return Err(AdminError::DocumentMismatch);
        }
        let owner = self
            .resolver
            .document_owner(req.document_id)
            .await?
            .ok_or(AdminError::DocumentNotFound(req.document_id))?;

        let message = ServerMessage::from(req.event);
        let delivered = self.unicast(room.document_id, Channel::Sharing, owner, &message)?;
        Ok(delivery(room, delivered))
    }

    fn unicast(
        &self,
        document_id: Uuid,
        channel: Channel,
        user_id: Uuid,
        message: &ServerMessage,
    ) -> Result<usize, AdminError> {
        let frame = message.to_frame()?;
        let key = RoomKey::new(document_id, channel);
        let delivered = self.multiplexer.send_to_user(&key, user_id, &frame);
        if delivered == 0 {
            info!(%user_id, room = %key, "Admin event not delivered, user offline");
        }
        Ok(delivered)
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, AdminError> {
    serde_json::from_slice(body).map_err(|e| AdminError::InvalidPayload(e.to_string()))
}

fn check_document(room: &RoomIdentity, document_id: Uuid) -> Result<(), AdminError> {
    if room.document_id != document_id {
        return Err(AdminError::DocumentMismatch);
    }
    Ok(())
}

fn delivery(room: &RoomIdentity, delivered: usize) -> Value {
    json!({
        "success": true,
        "documentId": room.document_id,
        "room": room.raw_name,
        "deliveredConnections": delivered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessGrant, AuthContext};
    use crate::db::MemoryStore;
    use crate::room::{Connection, Outbound};
    use axum::http::{header::AUTHORIZATION, HeaderValue};
    use tokio::sync::mpsc;

    const TOKEN: &str = "operator-token";

    struct Fixture {
        plane: AdminPlane,
        multiplexer: Arc<ConnectionMultiplexer>,
        store: Arc<MemoryStore>,
        document: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let multiplexer = Arc::new(ConnectionMultiplexer::new());
        let plane = AdminPlane::new(
            AdminAuth::new(Some(TOKEN.to_string())),
            multiplexer.clone(),
            PermissionResolver::new(store.clone()),
        );
        Fixture {
            plane,
            multiplexer,
            store,
            document: Uuid::new_v4(),
        }
    }

    fn authorized() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer operator-token"));
        headers
    }

    fn connect(
        multiplexer: &ConnectionMultiplexer,
        document: Uuid,
        user: Uuid,
        channel: Channel,
    ) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = AuthContext {
            user_id: user,
            document_id: document,
            channel,
            grant: AccessGrant::owner(Utc::now()),
        };
        multiplexer.register(Arc::new(Connection::from_context(&ctx, tx)));
        rx
    }

    fn admin_path(room: &str, action: &str) -> String {
        format!("/parties/main/{}/admin/{}", room, action)
    }

    async fn post(f: &Fixture, action: &str, body: Value) -> Result<Value, AdminError> {
        let path = admin_path(&format!("doc:{}", f.document), action);
        f.plane
            .handle(&Method::POST, &authorized(), &path, action, body.to_string().as_bytes())
            .await
    }

    #[tokio::test]
    async fn test_request_gating() {
        let f = fixture();
        let room = admin_path(&format!("doc:{}", f.document), "revoke");
        let body = json!({"documentId": f.document, "userIds": [Uuid::new_v4()]}).to_string();

        let err = f
            .plane
            .handle(&Method::GET, &authorized(), &room, "revoke", body.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::MethodNotAllowed));

        let err = f
            .plane
            .handle(&Method::POST, &authorized(), &room, "explode", body.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::UnknownAction(_)));

        let err = f
            .plane
            .handle(&Method::POST, &HeaderMap::new(), &room, "revoke", body.as_bytes())
            .await
            .unwrap_err();
        assert_eq!(ServiceError::from(err).status(), axum::http::StatusCode::FORBIDDEN);

        let err = f
            .plane
            .handle(&Method::POST, &authorized(), &admin_path("doc:not-a-uuid", "revoke"), "revoke", body.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::InvalidRoom(_)));
    }

    #[tokio::test]
    async fn test_room_segment_decoded_once() {
        let f = fixture();
        let body = json!({"documentId": f.document, "userIds": [Uuid::new_v4()]}).to_string();

        let single = admin_path(&format!("doc%3A{}", f.document), "revoke");
        let result = f
            .plane
            .handle(&Method::POST, &authorized(), &single, "revoke", body.as_bytes())
            .await
            .unwrap();
        assert_eq!(result["success"], true);

        let double = admin_path(&format!("doc%253A{}", f.document), "revoke");
        let err = f
            .plane
            .handle(&Method::POST, &authorized(), &double, "revoke", body.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::InvalidRoom(_)));
        assert_eq!(ServiceError::from(err).status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_revoke_closes_only_targets_in_every_channel() {
        let f = fixture();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut b_sync = connect(&f.multiplexer, f.document, b, Channel::Sync);
        let mut b_perms = connect(&f.multiplexer, f.document, b, Channel::Permissions);
        let mut a_sync = connect(&f.multiplexer, f.document, a, Channel::Sync);

        let result = post(&f, "revoke", json!({"documentId": f.document, "userIds": [b], "reason": "share removed"}))
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["closedConnections"], 2);

        for rx in [&mut b_sync, &mut b_perms] {
            assert_eq!(
                rx.try_recv().unwrap(),
                Outbound::Close {
                    code: 4403,
                    reason: "share removed".into()
                }
            );
        }
        assert!(a_sync.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_revoke_validates_user_ids_and_document() {
        let f = fixture();
        let err = post(&f, "revoke", json!({"documentId": f.document, "userIds": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::InvalidPayload(_)));

        let many: Vec<Uuid> = (0..=MAX_REVOKE_USERS).map(|_| Uuid::new_v4()).collect();
        let err = post(&f, "revoke", json!({"documentId": f.document, "userIds": many}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::InvalidPayload(_)));

        let err = post(&f, "revoke", json!({"documentId": Uuid::new_v4(), "userIds": [Uuid::new_v4()]}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::DocumentMismatch));

        let err = post(&f, "revoke", json!({"documentId": f.document, "userIds": ["nope"]}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_permissions_update_unicast() {
        let f = fixture();
        let (target, other) = (Uuid::new_v4(), Uuid::new_v4());
        let mut target_rx = connect(&f.multiplexer, f.document, target, Channel::Permissions);
        let mut other_rx = connect(&f.multiplexer, f.document, other, Channel::Permissions);

        let result = post(
            &f,
            "permissions-update",
            json!({
                "documentId": f.document,
                "userId": target,
                "role": "editor",
                "canView": true,
                "canComment": true,
                "canEdit": true,
                "updatedAt": "2024-03-01T00:00:00Z",
            }),
        )
        .await
        .unwrap();
        assert_eq!(result["deliveredConnections"], 1);

        match target_rx.try_recv().unwrap() {
            Outbound::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "permissions:update");
                assert_eq!(value["role"], "editor");
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(other_rx.try_recv().is_err());

        let err = post(
            &f,
            "permissions-update",
            json!({
                "documentId": f.document,
                "userId": target,
                "role": "admin",
                "canView": true,
                "canComment": true,
                "canEdit": true,
                "updatedAt": "2024-03-01T00:00:00Z",
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdminError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_access_revoked_offline_user_reports_zero() {
        let f = fixture();
        let result = post(
            &f,
            "access-revoked",
            json!({
                "documentId": f.document,
                "userId": Uuid::new_v4(),
                "reason": "share_removed",
                "revokedAt": "2024-03-01T00:00:00Z",
            }),
        )
        .await
        .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["deliveredConnections"], 0);

        let err = post(
            &f,
            "access-revoked",
            json!({
                "documentId": f.document,
                "userId": Uuid::new_v4(),
                "reason": "bored",
                "revokedAt": "2024-03-01T00:00:00Z",
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdminError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_collaborator_event_reaches_owner_only() {
        let f = fixture();
        let (owner, other) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.seed(
            "documents",
            vec![json!({"id": f.document.to_string(), "owner_id": owner.to_string()})],
        );
        let mut owner_rx = connect(&f.multiplexer, f.document, owner, Channel::Sharing);
        let mut other_rx = connect(&f.multiplexer, f.document, other, Channel::Sharing);

        let removed = Uuid::new_v4();
        let result = post(
            &f,
            "collaborator-event",
            json!({
                "documentId": f.document,
                "event": {"type": "collaborator:remove", "documentId": f.document, "userId": removed},
            }),
        )
        .await
        .unwrap();
        assert_eq!(result["deliveredConnections"], 1);

        match owner_rx.try_recv().unwrap() {
            Outbound::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "collaborator:remove");
                assert_eq!(value["userId"], removed.to_string());
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_collaborator_event_rejects_unknown_shapes_and_documents() {
        let f = fixture();
        let err = post(
            &f,
            "collaborator-event",
            json!({"documentId": f.document, "event": {"type": "collaborator:promote", "documentId": f.document}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdminError::InvalidPayload(_)));

        let err = post(
            &f,
            "collaborator-event",
            json!({
                "documentId": f.document,
                "event": {"type": "collaborator:remove", "documentId": f.document, "userId": Uuid::new_v4()},
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdminError::DocumentNotFound(_)));
    }
}
