//! Registered users and their password credentials.

use std::path::PathBuf;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Result, SandboxError};
use crate::store::PersistentStore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub email: String,
    pub username: String,
    /// `<salt-hex>$<sha256-hex>`
    pub password_hash: String,
    #[serde(default)]
    pub created_at: u64,
}

/// Principals keyed by id; email and username are unique.
pub struct PrincipalStore {
    store: PersistentStore<Principal>,
}

impl PrincipalStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            store: PersistentStore::open(path)?,
        })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn scratch() -> Self {
        Self {
            store: PersistentStore::scratch(),
        }
    }

    pub fn register(&self, username: &str, email: &str, password: &str) -> Result<Principal> {
        let username = username.trim();
        let email = normalize_email(email)?;
        if username.is_empty() {
            return Err(SandboxError::Validation("username is required".into()));
        }
        if password.is_empty() {
            return Err(SandboxError::Validation("password is required".into()));
        }

        let principal = Principal {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.clone(),
            username: username.to_string(),
            password_hash: hash_password(password),
            created_at: crate::util::now_ts(),
        };

        let inserted = self
            .store
            .insert_unique(principal.id.clone(), principal.clone(), |p| {
                p.email == email || p.username == username
            })?;
        if !inserted {
            return Err(SandboxError::Conflict(
                "Username or email is already registered".into(),
            ));
        }

        tracing::info!(principal = %principal.id, "registered principal");
        Ok(principal)
    }

    /// Check an email/password pair. Unknown email and wrong password are
    /// reported identically.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<Principal> {
        let rejected = || SandboxError::Unauthenticated("Invalid email or password".into());
        let email = normalize_email(email).map_err(|_| rejected())?;
        let principal = self.get_by_email(&email)?.ok_or_else(rejected)?;
        if verify_password(password, &principal.password_hash) {
            Ok(principal)
        } else {
            Err(rejected())
        }
    }

    pub fn get_by_email(&self, email: &str) -> Result<Option<Principal>> {
        let email = email.trim().to_ascii_lowercase();
        self.store.find(|p| p.email == email)
    }
}

fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_ascii_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(SandboxError::Validation(format!(
            "'{email}' is not a valid email address"
        ))),
    }
}

pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    format!("{}${}", hex::encode(salt), salted_digest(&salt, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let candidate = salted_digest(&salt, password);
    candidate.as_bytes().ct_eq(digest_hex.as_bytes()).into()
}

fn salted_digest(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_authenticate() {
        let store = PrincipalStore::scratch();
        let alice = store.register("alice", "Alice@Example.com", "hunter2").unwrap();
        assert_eq!(alice.email, "alice@example.com");
        assert_ne!(alice.password_hash, "hunter2");

        let authed = store.authenticate("alice@example.com", "hunter2").unwrap();
        assert_eq!(authed.id, alice.id);
    }

    #[test]
    fn duplicate_email_or_username_conflicts() {
        let store = PrincipalStore::scratch();
        store.register("alice", "alice@example.com", "pw").unwrap();

        let err = store.register("alice2", "alice@example.com", "pw").unwrap_err();
        assert!(matches!(err, SandboxError::Conflict(_)));
        let err = store.register("alice", "other@example.com", "pw").unwrap_err();
        assert!(matches!(err, SandboxError::Conflict(_)));
    }

    #[test]
    fn wrong_password_and_unknown_email_look_the_same() {
        let store = PrincipalStore::scratch();
        store.register("bob", "bob@example.com", "right").unwrap();

        let wrong = store.authenticate("bob@example.com", "wrong").unwrap_err();
        let unknown = store.authenticate("nobody@example.com", "right").unwrap_err();
        assert_eq!(wrong, unknown);
        assert!(matches!(wrong, SandboxError::Unauthenticated(_)));
    }

    #[test]
    fn rejects_malformed_input() {
        let store = PrincipalStore::scratch();
        assert!(matches!(
            store.register("x", "not-an-email", "pw"),
            Err(SandboxError::Validation(_))
        ));
        assert!(matches!(
            store.register("", "x@example.com", "pw"),
            Err(SandboxError::Validation(_))
        ));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("same");
        let b = hash_password("same");
        assert_ne!(a, b);
        assert!(verify_password("same", &a));
        assert!(verify_password("same", &b));
        assert!(!verify_password("same", "garbage"));
    }
}
