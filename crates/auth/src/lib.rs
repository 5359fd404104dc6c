//! Token issuance and request authentication.
//!
//! Tokens are opaque, high-entropy strings shown to the caller exactly once
//! at creation time. Only their SHA-256 digest is ever persisted; the
//! Authenticator never reconstructs a token from its hash.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use store::{ApiKeyRecord, Database, UserRecord};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Fixed prefix on every issued token, making tokens visually identifiable
/// (e.g. in logs or leaked-credential scans) without revealing entropy.
const TOKEN_PREFIX: &str = "ci_";

/// Raw random bytes behind a generated token. 30 bytes base64-encode to
/// exactly 40 URL-safe characters with no padding.
const TOKEN_ENTROPY_BYTES: usize = 30;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid or revoked API key")]
    InvalidKey,
    #[error("user not found or inactive")]
    InactiveUser,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Generates a new bearer token. The caller is responsible for hashing it
/// with [`hash_token`] before persisting it via [`store::Database`].
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let encoded = URL_SAFE_NO_PAD.encode(bytes);
    format!("{TOKEN_PREFIX}{encoded}")
}

/// SHA-256 hex digest of a token. This is the only form of the token ever
/// written to the database.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}

/// Resolves a bearer token to its owning user, enforcing that both the key
/// and the user are active, and records the key's last-used timestamp.
pub struct Authenticator {
    store: Database,
}

impl Authenticator {
    pub fn new(store: Database) -> Self {
        Self { store }
    }

    /// Issues a new API key for `user_id`, returning the plaintext token.
    /// The token is never recoverable again once this call returns.
    pub async fn issue_token(
        &self,
        user_id: Uuid,
        name: Option<&str>,
    ) -> Result<(String, ApiKeyRecord), AuthError> {
        let token = generate_token();
        let hash = hash_token(&token);
        let record = self
            .store
            .create_api_key(store::NewApiKey {
                user_id,
                key_hash: &hash,
                name,
            })
            .await?;
        Ok((token, record))
    }

    /// Authenticates a bearer token, returning the resolved user on success.
    pub async fn authenticate(&self, token: &str) -> Result<UserRecord, AuthError> {
        let hash = hash_token(token);

        let key = self
            .store
            .get_api_key_by_hash(&hash)
            .await?
            .ok_or(AuthError::InvalidKey)?;
        if !key.is_active {
            return Err(AuthError::InvalidKey);
        }

        let user = self
            .store
            .get_user(key.user_id)
            .await?
            .ok_or(AuthError::InactiveUser)?;
        if !user.is_active {
            return Err(AuthError::InactiveUser);
        }

        if let Err(err) = self.store.touch_api_key_last_used(key.id, Utc::now()).await {
            warn!(key_id = %key.id, error = %err, "failed to record api key last-used timestamp");
        }

        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_have_expected_shape() {
        let token = generate_token();
        assert!(token.starts_with("ci_"));
        assert_eq!(token.len(), "ci_".len() + 40);
    }

    #[test]
    fn tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
    }

    #[test]
    fn hash_is_deterministic_and_hex() {
        let token = "ci_fixedvalueforthistest";
        let first = hash_token(token);
        let second = hash_token(token);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn authenticate_round_trip() {
        let store = Database::connect("sqlite::memory:").await.unwrap();
        let user = store
            .create_user(store::NewUser {
                display_name: "Alice",
                email: "alice@example.com",
            })
            .await
            .unwrap();

        let auth = Authenticator::new(store.clone());
        let (token, _record) = auth.issue_token(user.id, Some("laptop")).await.unwrap();

        let resolved = auth.authenticate(&token).await.unwrap();
        assert_eq!(resolved.id, user.id);
    }

    #[tokio::test]
    async fn revoked_key_is_rejected() {
        let store = Database::connect("sqlite::memory:").await.unwrap();
        let user = store
            .create_user(store::NewUser {
                display_name: "Alice",
                email: "alice@example.com",
            })
            .await
            .unwrap();

        let auth = Authenticator::new(store.clone());
        let (token, record) = auth.issue_token(user.id, None).await.unwrap();
        store.revoke_api_key(record.id).await.unwrap();

        let result = auth.authenticate(&token).await;
        assert!(matches!(result, Err(AuthError::InvalidKey)));
    }

    #[tokio::test]
    async fn inactive_user_is_rejected() {
        let store = Database::connect("sqlite::memory:").await.unwrap();
        let user = store
            .create_user(store::NewUser {
                display_name: "Alice",
                email: "alice@example.com",
            })
            .await
            .unwrap();

        let auth = Authenticator::new(store.clone());
        let (token, _record) = auth.issue_token(user.id, None).await.unwrap();
        store.set_user_active(user.id, false).await.unwrap();

        let result = auth.authenticate(&token).await;
        assert!(matches!(result, Err(AuthError::InactiveUser)));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let store = Database::connect("sqlite::memory:").await.unwrap();
        let auth = Authenticator::new(store);
        let result = auth.authenticate("ci_not_a_real_token").await;
        assert!(matches!(result, Err(AuthError::InvalidKey)));
    }
}
