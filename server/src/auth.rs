//! Credential service for API key issuance and verification.
//!
//! Bots and dashboards authenticate by submitting a plaintext API key over
//! the WebSocket (`x-api-key` action). The hub never stores that plaintext:
//! only the hex-encoded SHA-256 digest is persisted, and lookups hash the
//! submitted secret first.
//!
//! # Overview
//!
//! 1. An operator calls `POST /api/v1/keys` with the admin token
//! 2. [`CredentialService::issue`] generates 32 random bytes, encodes them as
//!    base64-url, persists the digest, and returns the plaintext exactly once
//! 3. A connection submits the plaintext; [`CredentialService::verify`]
//!    hashes it and resolves the [`Credential`] through a read-through cache
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use mainframe_hub::auth::{CredentialService, Permissions, TokenType};
//! use mainframe_hub::store::MemoryStore;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let service = CredentialService::new(Arc::new(MemoryStore::new()));
//! let secret = service
//!     .issue(Permissions::read_write(), "ops@example.com", 0, TokenType::BotClient)
//!     .await
//!     .unwrap();
//!
//! let credential = service.verify(secret.expose()).await.unwrap().unwrap();
//! assert!(credential.permissions.write);
//! # });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use crate::store::{Store, StoreError};

/// Size of a generated API key in bytes.
const SECRET_BYTES: usize = 32;

/// Errors from issuing or verifying credentials.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The backing store failed.
    #[error("credential persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

/// Errors from admin token validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No admin token was supplied with the request.
    #[error("missing admin token")]
    MissingToken,

    /// The supplied admin token does not match.
    #[error("invalid admin token")]
    InvalidToken,
}

/// Capabilities granted to a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
}

impl Permissions {
    /// Read-only access: receives broadcasts, cannot publish events.
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    /// Full access.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }
}

/// The kind of peer a credential was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenType {
    /// A Minecraft or Discord bot.
    BotClient,
    /// A dashboard or other read-mostly client.
    #[default]
    Client,
}

/// A persisted API key record.
///
/// Holds the digest of the secret, never the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub key_hash: String,
    pub owner_contact: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
    pub permissions: Permissions,
    /// Requests per hour. Zero means unlimited.
    pub rate_limit: u32,
    pub token_type: TokenType,
}

/// A freshly generated plaintext API key.
///
/// The value is only reachable through [`IssuedSecret::expose`] so it does
/// not end up in `Debug` output or log fields by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedSecret(String);

impl IssuedSecret {
    /// Returns the plaintext secret.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consumes the wrapper, returning the plaintext.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for IssuedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IssuedSecret(<redacted>)")
    }
}

/// Returns the hex-encoded SHA-256 digest of `secret`.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Issues and verifies API keys against a [`Store`].
pub struct CredentialService {
    store: Arc<dyn Store>,
    /// Verified credentials keyed by digest.
    cache: RwLock<HashMap<String, Credential>>,
}

impl CredentialService {
    /// Creates a service backed by `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Generates, persists, and returns a new API key.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Persistence`] if the record could not be
    /// stored. No secret is returned in that case.
    pub async fn issue(
        &self,
        permissions: Permissions,
        owner_contact: &str,
        rate_limit: u32,
        token_type: TokenType,
    ) -> Result<IssuedSecret, CredentialError> {
        let secret = generate_secret();
        let now = chrono::Utc::now().timestamp_millis();
        let credential = Credential {
            key_hash: hash_secret(&secret),
            owner_contact: owner_contact.to_string(),
            created_at: now,
            updated_at: now,
            permissions,
            rate_limit,
            token_type,
        };

        self.store.persist_credential(&credential).await?;

        info!(
            read = permissions.read,
            write = permissions.write,
            rate_limit,
            token_type = ?token_type,
            "Issued API key"
        );

        self.cache
            .write()
            .await
            .insert(credential.key_hash.clone(), credential);

        Ok(IssuedSecret(secret))
    }

    /// Resolves a plaintext secret to its credential.
    ///
    /// Returns `Ok(None)` when no credential matches. Hits are cached; misses
    /// are not, so a key issued later is found on the next attempt.
    pub async fn verify(&self, secret: &str) -> Result<Option<Credential>, CredentialError> {
        let key_hash = hash_secret(secret);

        if let Some(credential) = self.cache.read().await.get(&key_hash) {
            trace!("Credential cache hit");
            return Ok(Some(credential.clone()));
        }

        let Some(credential) = self.store.find_credential(&key_hash).await? else {
            debug!("No credential matches submitted key");
            return Ok(None);
        };

        self.cache
            .write()
            .await
            .insert(key_hash, credential.clone());

        Ok(Some(credential))
    }

    /// Number of cached credentials.
    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }
}

impl fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialService").finish_non_exhaustive()
    }
}

/// Compares a supplied admin token against the configured one in constant
/// time.
pub fn validate_admin_token(provided: Option<&str>, expected: &str) -> Result<(), AuthError> {
    let provided = provided
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)?;

    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> (CredentialService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (CredentialService::new(store.clone()), store)
    }

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        assert_eq!(
            hash_secret("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn generated_secret_is_43_url_safe_chars() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 43);
        assert_eq!(URL_SAFE_NO_PAD.decode(&secret).unwrap().len(), SECRET_BYTES);
    }

    #[test]
    fn issued_secret_debug_is_redacted() {
        let secret = IssuedSecret("super-secret-value".to_string());
        let debug = format!("{secret:?}");
        assert!(!debug.contains("super-secret-value"));
        assert!(debug.contains("redacted"));
    }

    #[tokio::test]
    async fn issue_persists_only_the_digest() {
        let (service, store) = service();
        let secret = service
            .issue(Permissions::read_only(), "a@b.c", 100, TokenType::Client)
            .await
            .unwrap();

        let stored = store
            .find_credential(&hash_secret(secret.expose()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.owner_contact, "a@b.c");
        assert_eq!(stored.rate_limit, 100);
        assert_ne!(stored.key_hash, secret.expose());
        assert_eq!(store.credential_count(), 1);
    }

    #[tokio::test]
    async fn verify_finds_issued_key() {
        let (service, _) = service();
        let secret = service
            .issue(Permissions::read_write(), "a@b.c", 0, TokenType::BotClient)
            .await
            .unwrap();

        let credential = service.verify(secret.expose()).await.unwrap().unwrap();
        assert_eq!(credential.permissions, Permissions::read_write());
        assert_eq!(credential.token_type, TokenType::BotClient);
    }

    #[tokio::test]
    async fn verify_unknown_key_returns_none() {
        let (service, _) = service();
        assert!(service.verify("not-a-key").await.unwrap().is_none());
        assert_eq!(service.cached_count().await, 0);
    }

    #[tokio::test]
    async fn verify_reads_through_to_store() {
        let store = Arc::new(MemoryStore::new());
        let issuer = CredentialService::new(store.clone());
        let secret = issuer
            .issue(Permissions::read_only(), "a@b.c", 0, TokenType::Client)
            .await
            .unwrap();

        let fresh = CredentialService::new(store);
        assert_eq!(fresh.cached_count().await, 0);
        assert!(fresh.verify(secret.expose()).await.unwrap().is_some());
        assert_eq!(fresh.cached_count().await, 1);
    }

    #[test]
    fn token_type_uses_kebab_case() {
        assert_eq!(
            serde_json::to_value(TokenType::BotClient).unwrap(),
            serde_json::json!("bot-client")
        );
        let parsed: TokenType = serde_json::from_value(serde_json::json!("client")).unwrap();
        assert_eq!(parsed, TokenType::Client);
    }

    #[test]
    fn admin_token_validation() {
        assert_eq!(validate_admin_token(Some("s3cret"), "s3cret"), Ok(()));
        assert_eq!(
            validate_admin_token(Some("wrong"), "s3cret"),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            validate_admin_token(None, "s3cret"),
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            validate_admin_token(Some(""), "s3cret"),
            Err(AuthError::MissingToken)
        );
    }
}
