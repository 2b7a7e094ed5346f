use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signed claims scoping one client identity to exactly one topic.
///
/// Validity is a pure function of the signature and the clock; the server
/// keeps no token state, so a credential cannot be revoked before expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub topic: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Malformed,
    BadSignature,
    Expired,
}

impl TokenError {
    pub fn reason(self) -> &'static str {
        match self {
            TokenError::Malformed => "malformed credential",
            TokenError::BadSignature => "invalid credential signature",
            TokenError::Expired => "expired credential",
        }
    }
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

impl std::error::Error for TokenError {}

/// Mints and verifies topic credentials. Token layout is
/// `<base64url(claims-json)>.<base64url(hmac-sha256)>`.
#[derive(Clone)]
pub struct TokenSigner {
    secret: String,
    ttl_secs: u64,
}

impl TokenSigner {
    pub fn new(secret: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            ttl_secs,
        }
    }

    pub fn mint(&self, id: &str, topic: &str) -> Result<String> {
        let issued_at = now_secs();
        let claims = Claims {
            id: id.to_owned(),
            topic: topic.to_owned(),
            issued_at,
            expires_at: issued_at.saturating_add(self.ttl_secs),
        };
        self.sign_claims(&claims)
    }

    pub fn sign_claims(&self, claims: &Claims) -> Result<String> {
        let body = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(claims).context("serialize credential claims")?);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .context("initialize credential signer")?;
        mac.update(body.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{body}.{signature}"))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, now_secs())
    }

    pub fn verify_at(&self, token: &str, now: u64) -> Result<Claims, TokenError> {
        let (body, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| TokenError::Malformed)?;
        mac.update(body.as_bytes());
        mac.verify_slice(&signature_bytes)
            .map_err(|_| TokenError::BadSignature)?;
        let claims_bytes = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&claims_bytes).map_err(|_| TokenError::Malformed)?;
        if now >= claims.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
