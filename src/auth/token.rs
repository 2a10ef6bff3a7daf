//! Bearer token verification.
//!
//! Tokens carrying a `kid` are checked against the remote JSON Web Key Set
//! when one is configured; HMAC-signed tokens fall back to the shared
//! secret. Issuer is enforced when configured and audience defaults to
//! `authenticated`.

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AuthError;

/// Audience expected when none is configured
pub const DEFAULT_AUDIENCE: &str = "authenticated";

/// Identity extracted from a verified token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: Uuid,
    /// Free-form `role` claim of the token, informational only
    pub role_claim: Option<String>,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError>;
}

/// Short digest of a token, safe to log
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..6])
}

/// Minimum time between two fetches of the same key set
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

struct CachedSet {
    cell: Arc<OnceCell<Arc<JwkSet>>>,
    created: Instant,
}

impl CachedSet {
    fn new() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            created: Instant::now(),
        }
    }
}

/// Process-wide cache of key sets keyed by source URL.
///
/// Each entry is initialized once and immutable afterwards; a refresh swaps
/// in a new entry instead of mutating the old one, at most once per
/// `MIN_REFRESH_INTERVAL`. Concurrent callers share the pending fetch.
pub struct KeySetRegistry {
    client: reqwest::Client,
    sets: DashMap<String, CachedSet>,
}

impl KeySetRegistry {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            sets: DashMap::new(),
        }
    }

    /// Key set for `url`, fetched on first use
    pub async fn get(&self, url: &str) -> Result<Arc<JwkSet>, AuthError> {
        let cell = self.sets.entry(url.to_string()).or_insert_with(CachedSet::new).cell.clone();
        cell.get_or_try_init(|| self.fetch(url)).await.cloned()
    }

    /// Fetch the set again unless the cached one is younger than
    /// `MIN_REFRESH_INTERVAL`, in which case the cached one is returned
    pub async fn refresh(&self, url: &str) -> Result<Arc<JwkSet>, AuthError> {
        let cell = {
            let mut entry = self.sets.entry(url.to_string()).or_insert_with(CachedSet::new);
            if entry.created.elapsed() >= MIN_REFRESH_INTERVAL {
                *entry = CachedSet::new();
            } else {
                debug!("Key set {} refreshed recently, keeping cached copy", url);
            }
            entry.cell.clone()
        };
        cell.get_or_try_init(|| self.fetch(url)).await.cloned()
    }

    pub fn cached_sources(&self) -> usize {
        self.sets.len()
    }

    async fn fetch(&self, url: &str) -> Result<Arc<JwkSet>, AuthError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::KeySetUnavailable(format!(
                "key set endpoint returned {}",
                response.status()
            )));
        }

        let set = response
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?;

        info!("Loaded {} signing key(s) from {}", set.keys.len(), url);
        Ok(Arc::new(set))
    }
}

/// Settings for [`JwtVerifier`]
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub jwks_url: Option<String>,
    pub shared_secret: Option<String>,
    pub issuer: Option<String>,
    pub audience: String,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            jwks_url: None,
            shared_secret: None,
            issuer: None,
            audience: DEFAULT_AUDIENCE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    role: Option<String>,
}

/// Signed-token verifier backed by a key set registry
pub struct JwtVerifier {
    config: VerifierConfig,
    keys: Arc<KeySetRegistry>,
}

impl JwtVerifier {
    pub fn new(config: VerifierConfig, keys: Arc<KeySetRegistry>) -> Self {
        Self { config, keys }
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[self.config.audience.as_str()]);
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }
        validation
    }

    async fn key_for(&self, kid: &str, jwks_url: &str) -> Result<DecodingKey, AuthError> {
        let set = self.keys.get(jwks_url).await?;
        let set = if set.find(kid).is_some() {
            set
        } else {
            debug!("Key id {} not cached, refreshing {}", kid, jwks_url);
            self.keys.refresh(jwks_url).await?
        };

        let jwk = set
            .find(kid)
            .ok_or_else(|| AuthError::InvalidToken(format!("unknown key id {}", kid)))?;
        DecodingKey::from_jwk(jwk).map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let key = match (&header.kid, &self.config.jwks_url) {
            (Some(kid), Some(url)) => self.key_for(kid, url).await?,
            _ => match (&self.config.shared_secret, header.alg) {
                (Some(secret), Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) => {
                    DecodingKey::from_secret(secret.as_bytes())
                }
                _ => {
                    return Err(AuthError::InvalidToken(format!(
                        "no verification key for {:?} token",
                        header.alg
                    )))
                }
            },
        };

        let data = decode::<Claims>(token, &key, &self.validation(header.alg)).map_err(|e| {
            warn!("Rejected token {}: {}", token_fingerprint(token), e);
            AuthError::InvalidToken(e.to_string())
        })?;

        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| AuthError::InvalidToken("subject is not a UUID".to_string()))?;

        Ok(VerifiedIdentity {
            user_id,
            role_claim: data.claims.role,
        })
    }
}
