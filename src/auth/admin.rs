//! Operator token check for the admin control plane.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::extract_bearer_header;

type HmacSha256 = Hmac<Sha256>;

/// Fallback header carrying the operator token
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Compares presented operator tokens against the configured one.
///
/// Both sides are MACed under a per-process random key and the tags are
/// compared with `verify_slice`, so timing never depends on the token bytes.
/// Without a configured token every request is denied.
pub struct AdminAuth {
    mac: Option<HmacSha256>,
    expected: Option<Vec<u8>>,
}

impl AdminAuth {
    pub fn new(token: Option<String>) -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let mac = HmacSha256::new_from_slice(&key).ok();

        let expected = token.filter(|t| !t.is_empty()).and_then(|t| {
            let mut tag = mac.clone()?;
            tag.update(t.as_bytes());
            Some(tag.finalize().into_bytes().to_vec())
        });

        Self { mac, expected }
    }

    pub fn is_configured(&self) -> bool {
        self.expected.is_some()
    }

    pub fn verify(&self, presented: &str) -> bool {
        let (Some(mac), Some(expected)) = (&self.mac, &self.expected) else {
            return false;
        };
        let mut mac = mac.clone();
        mac.update(presented.as_bytes());
        mac.verify_slice(expected).is_ok()
    }

    /// Bearer token first, then the `x-admin-token` header
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        let presented = extract_bearer_header(headers).or_else(|| {
            headers
                .get(ADMIN_TOKEN_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        });
        match presented {
            Some(token) if !token.is_empty() => self.verify(&token),
            _ => false,
        }
    }
}
