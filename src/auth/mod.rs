//! Authentication and authorization for rooms and admin endpoints.
//!
//! This module handles:
//! - Bearer token verification against a remote key set or shared secret
//! - Per-document permission resolution (ownership, then active shares)
//! - The gateway that rejects or annotates room requests
//! - Constant-time operator token checks for the admin control plane

mod admin;
mod gateway;
mod permissions;
mod token;

pub use admin::{AdminAuth, ADMIN_TOKEN_HEADER};
pub use gateway::{extract_bearer, extract_bearer_header, room_auth, AuthGateway};
pub use permissions::{Collaborator, PermissionResolver};
#[cfg(test)]
pub(crate) use token::tests as test_tokens;
pub use token::{token_fingerprint, JwtVerifier, KeySetRegistry, TokenVerifier, VerifiedIdentity, VerifierConfig};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::DbError;
use crate::room::Channel;

/// Role a user holds on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Commentator,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Commentator => "commentator",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(Role::Owner),
            "editor" => Some(Role::Editor),
            "commentator" => Some(Role::Commentator),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

/// Capability set resolved for one (user, document) pair.
///
/// Computed fresh on every authorization and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub role: Role,
    pub can_view: bool,
    pub can_comment: bool,
    pub can_edit: bool,
    pub updated_at: DateTime<Utc>,
}

impl AccessGrant {
    /// Owners always hold every capability
    pub fn owner(updated_at: DateTime<Utc>) -> Self {
        Self {
            role: Role::Owner,
            can_view: true,
            can_comment: true,
            can_edit: true,
            updated_at,
        }
    }
}

/// Errors raised while authenticating or authorizing
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing bearer credential")]
    MissingCredential,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Key set unavailable: {0}")]
    KeySetUnavailable(String),

    #[error("Invalid room: {0}")]
    InvalidRoom(String),

    #[error("Access denied")]
    Forbidden,

    #[error("Permission lookup failed: {0}")]
    Store(#[from] DbError),

    #[error("Invalid connection context: {0}")]
    InvalidContext(String),
}

/// Names of the identity headers injected by the gateway
pub mod headers {
    pub const USER_ID: &str = "x-collab-user-id";
    pub const ROLE: &str = "x-collab-role";
    pub const CAN_VIEW: &str = "x-collab-can-view";
    pub const CAN_COMMENT: &str = "x-collab-can-comment";
    pub const CAN_EDIT: &str = "x-collab-can-edit";
    pub const PERMISSIONS_UPDATED_AT: &str = "x-collab-permissions-updated-at";
    pub const DOCUMENT_ID: &str = "x-collab-document-id";
    pub const CHANNEL: &str = "x-collab-channel";

    pub const ALL: [&str; 8] = [
        USER_ID,
        ROLE,
        CAN_VIEW,
        CAN_COMMENT,
        CAN_EDIT,
        PERMISSIONS_UPDATED_AT,
        DOCUMENT_ID,
        CHANNEL,
    ];
}

/// Trusted identity attached to a request once the gateway accepts it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub user_id: Uuid,
    pub document_id: Uuid,
    pub channel: Channel,
    #[serde(flatten)]
    pub grant: AccessGrant,
}

impl AuthContext {
    /// Replace any client-supplied identity headers with the resolved ones
    pub fn apply_headers(&self, map: &mut HeaderMap) {
        strip_identity_headers(map);

        let pairs = [
            (headers::USER_ID, self.user_id.to_string()),
            (headers::ROLE, self.grant.role.as_str().to_string()),
            (headers::CAN_VIEW, self.grant.can_view.to_string()),
            (headers::CAN_COMMENT, self.grant.can_comment.to_string()),
            (headers::CAN_EDIT, self.grant.can_edit.to_string()),
            (headers::PERMISSIONS_UPDATED_AT, self.grant.updated_at.to_rfc3339()),
            (headers::DOCUMENT_ID, self.document_id.to_string()),
            (headers::CHANNEL, self.channel.as_str().to_string()),
        ];
        for (name, value) in pairs {
            if let Ok(value) = HeaderValue::from_str(&value) {
                map.insert(HeaderName::from_static(name), value);
            }
        }
    }

    /// Rebuild the context from injected headers
    pub fn from_headers(map: &HeaderMap) -> Result<Self, AuthError> {
        let get = |name: &str| -> Result<&str, AuthError> {
            map.get(name)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| AuthError::InvalidContext(format!("missing {}", name)))
        };
        let get_bool = |name: &str| -> Result<bool, AuthError> {
            match get(name)? {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(AuthError::InvalidContext(format!("{} is not a boolean: {}", name, other))),
            }
        };
        let invalid = |name: &str| AuthError::InvalidContext(format!("malformed {}", name));

        let user_id = Uuid::parse_str(get(headers::USER_ID)?).map_err(|_| invalid(headers::USER_ID))?;
        let document_id =
            Uuid::parse_str(get(headers::DOCUMENT_ID)?).map_err(|_| invalid(headers::DOCUMENT_ID))?;
        let role = Role::parse(get(headers::ROLE)?).ok_or_else(|| invalid(headers::ROLE))?;
        let channel = Channel::from_slug(get(headers::CHANNEL)?).ok_or_else(|| invalid(headers::CHANNEL))?;
        let updated_at = DateTime::parse_from_rfc3339(get(headers::PERMISSIONS_UPDATED_AT)?)
            .map_err(|_| invalid(headers::PERMISSIONS_UPDATED_AT))?
            .with_timezone(&Utc);

        Ok(Self {
            user_id,
            document_id,
            channel,
            grant: AccessGrant {
                role,
                can_view: get_bool(headers::CAN_VIEW)?,
                can_comment: get_bool(headers::CAN_COMMENT)?,
                can_edit: get_bool(headers::CAN_EDIT)?,
                updated_at,
            },
        })
    }
}

pub fn strip_identity_headers(map: &mut HeaderMap) {
    for name in headers::ALL {
        map.remove(name);
    }
}
