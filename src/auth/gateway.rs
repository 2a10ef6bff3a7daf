//! Auth gateway in front of every room route.
//!
//! Ordering of checks: credential, room, grant. Plain HTTP callers get the
//! failure as a status code; WebSocket callers are upgraded and immediately
//! closed with a close code so browsers can tell the failures apart.

use axum::{
    extract::{ws::WebSocketUpgrade, FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{token_fingerprint, AuthContext, AuthError, PermissionResolver, TokenVerifier};
use crate::error::ServiceError;
use crate::room::parse_room;
use crate::sync::protocol::close_socket;

/// Verifies credentials and resolves grants for room requests
pub struct AuthGateway {
    verifier: Arc<dyn TokenVerifier>,
    resolver: PermissionResolver,
}

impl AuthGateway {
    pub fn new(verifier: Arc<dyn TokenVerifier>, resolver: PermissionResolver) -> Self {
        Self { verifier, resolver }
    }

    /// Shared decision for connections and plain requests
    pub async fn authorize(&self, token: Option<&str>, path: &str) -> Result<AuthContext, AuthError> {
        let token = token.ok_or(AuthError::MissingCredential)?;
        let identity = self.verifier.verify(token).await?;

        let room = parse_room(path).ok_or_else(|| AuthError::InvalidRoom(path.to_string()))?;

        let grant = self
            .resolver
            .resolve(identity.user_id, room.document_id)
            .await?
            .filter(|grant| grant.can_view)
            .ok_or(AuthError::Forbidden)?;

        debug!(
            "Authorized user {} as {} on {} (token {})",
            identity.user_id,
            grant.role.as_str(),
            room.raw_name,
            token_fingerprint(token)
        );

        Ok(AuthContext {
            user_id: identity.user_id,
            document_id: room.document_id,
            channel: room.channel,
            grant,
        })
    }

    /// Authorize a connection handshake
    pub async fn authorize_connection(&self, headers: &HeaderMap, uri: &Uri) -> Result<AuthContext, AuthError> {
        let token = extract_bearer(headers, uri);
        self.authorize(token.as_deref(), uri.path()).await
    }

    /// Authorize a plain request and annotate it with the resolved identity
    pub async fn authorize_request(&self, req: &mut Request) -> Result<AuthContext, AuthError> {
        let context = self.authorize_connection(req.headers(), req.uri()).await?;
        context.apply_headers(req.headers_mut());
        req.extensions_mut().insert(context.clone());
        Ok(context)
    }
}

/// Bearer credential from the `Authorization` header, else the `token`
/// query parameter
pub fn extract_bearer(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    extract_bearer_header(headers).or_else(|| {
        uri.query()?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .and_then(|(_, value)| urlencoding::decode(value).ok())
            .map(|value| value.into_owned())
            .filter(|t| !t.is_empty())
    })
}

/// Token of an `Authorization: Bearer` header, scheme matched case-insensitively
pub fn extract_bearer_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_string())
        })
        .filter(|t| !t.is_empty())
}

/// Middleware guarding the room routes
pub async fn room_auth(State(gateway): State<Arc<AuthGateway>>, mut req: Request, next: Next) -> Response {
    match gateway.authorize_request(&mut req).await {
        Ok(_) => next.run(req).await,
        Err(err) => {
            let err = ServiceError::from(err);
            warn!("Rejected {} {}: {}", req.method(), req.uri().path(), err);
            reject(req, err).await
        }
    }
}

async fn reject(req: Request, err: ServiceError) -> Response {
    let (mut parts, _) = req.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => {
            let code = err.close_code();
            let reason = err.public_reason();
            info!("Closing rejected connection with {}", code);
            ws.on_upgrade(move |socket| close_socket(socket, code, reason))
        }
        Err(_) => err.into_response(),
    }
}
