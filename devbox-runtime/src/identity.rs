//! Bearer-token identity: PASETO v4.local tokens carrying the principal email.
//!
//! Flow:
//! 1. `POST /auth/signup` or `POST /auth/login` issues a token for the email
//! 2. Client sends it as `Authorization: Bearer <token>`
//! 3. [`IdentityVerifier::verify`] turns the token back into the email

use std::time::Duration;

use pasetors::keys::SymmetricKey;
use pasetors::version4::V4;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Domain-specific salt for HKDF key derivation.
const HKDF_SALT: &[u8] = b"devbox-session-paseto-v4";
/// HKDF info parameter for the PASETO symmetric key derivation.
const HKDF_INFO: &[u8] = b"session-auth-symmetric-key-v1";

/// Resolve an opaque bearer token to a principal email.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<String>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: u64,
}

/// Issues and validates session tokens with a single symmetric key.
pub struct SessionAuthority {
    key: SymmetricKey<V4>,
    ttl: Duration,
}

impl SessionAuthority {
    /// Derive the key from `secret`, or use a random key when `None`
    /// (tokens then die with the process).
    pub fn new(secret: Option<&str>, ttl: Duration) -> Result<Self> {
        let key_bytes = match secret {
            Some(secret) if !secret.is_empty() => derive_symmetric_key(secret.as_bytes()),
            _ => {
                tracing::warn!("no session secret configured; tokens will not survive a restart");
                let mut bytes = [0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                bytes
            }
        };
        let key = SymmetricKey::<V4>::from(&key_bytes)
            .map_err(|e| SandboxError::Validation(format!("Invalid session key: {e}")))?;
        Ok(Self { key, ttl })
    }

    pub fn issue(&self, email: &str) -> Result<IssuedToken> {
        self.issue_at(email, crate::util::now_ts())
    }

    fn issue_at(&self, email: &str, now: u64) -> Result<IssuedToken> {
        let expires_at = now + self.ttl.as_secs();

        let mut claims = pasetors::claims::Claims::new()
            .map_err(|e| SandboxError::Unauthenticated(format!("Failed to create claims: {e}")))?;
        claims
            .subject(email)
            .map_err(|e| SandboxError::Unauthenticated(format!("Failed to set subject: {e}")))?;
        claims
            .issued_at(&rfc3339(now)?)
            .map_err(|e| SandboxError::Unauthenticated(format!("Failed to set iat claim: {e}")))?;
        claims
            .not_before(&rfc3339(now)?)
            .map_err(|e| SandboxError::Unauthenticated(format!("Failed to set nbf claim: {e}")))?;
        claims
            .expiration(&rfc3339(expires_at)?)
            .map_err(|e| SandboxError::Unauthenticated(format!("Failed to set expiration: {e}")))?;

        let access_token = pasetors::local::encrypt(&self.key, &claims, None, None)
            .map_err(|e| SandboxError::Unauthenticated(format!("Failed to encrypt token: {e}")))?;

        Ok(IssuedToken {
            access_token,
            token_type: "bearer".to_string(),
            expires_at,
        })
    }
}

impl IdentityVerifier for SessionAuthority {
    fn verify(&self, token: &str) -> Result<String> {
        let untrusted = pasetors::token::UntrustedToken::try_from(token)
            .map_err(|e| SandboxError::Unauthenticated(format!("Invalid token: {e}")))?;

        // Default rules reject expired and not-yet-valid tokens.
        let rules = pasetors::claims::ClaimsValidationRules::new();
        let trusted = pasetors::local::decrypt(&self.key, &untrusted, &rules, None, None)
            .map_err(|e| SandboxError::Unauthenticated(format!("Token rejected: {e}")))?;

        let payload: serde_json::Value = serde_json::from_str(trusted.payload())
            .map_err(|e| SandboxError::Unauthenticated(format!("Invalid token payload: {e}")))?;

        payload
            .get("sub")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| SandboxError::Unauthenticated("Missing subject in token".into()))
    }
}

fn rfc3339(ts: u64) -> Result<String> {
    time::OffsetDateTime::from_unix_timestamp(ts as i64)
        .map_err(|e| SandboxError::Validation(format!("Invalid timestamp: {e}")))?
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|e| SandboxError::Validation(format!("Failed to format timestamp: {e}")))
}

/// Derive a 32-byte symmetric key from input keying material using HKDF-SHA256.
fn derive_symmetric_key(ikm: &[u8]) -> [u8; 32] {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), ikm);
    let mut key = [0u8; 32];
    // 32 bytes is far below the HKDF-SHA256 output limit.
    if hk.expand(HKDF_INFO, &mut key).is_err() {
        unreachable!("HKDF-SHA256 expand to 32 bytes cannot fail");
    }
    key
}

/// Extract a Bearer token from an Authorization header value.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
}
