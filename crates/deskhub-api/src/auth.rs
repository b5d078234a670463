//! Credential checking seam used by the login handler

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use rand::rngs::OsRng;

use crate::models::{LoginLog, User};
use crate::store::StoreError;

/// Verifies credentials and records sessions.
///
/// `authenticate` returns `Ok(None)` for an unknown user or a wrong password;
/// `Err` is reserved for the backing store being unusable.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>, StoreError>;
    async fn issue_token(&self, user: &User, log: &LoginLog, expires_at: u64) -> Result<String, StoreError>;
    /// End the session behind `token`. Returns false when there was no live
    /// session for it.
    async fn revoke_token(&self, token: &str, now: u64) -> Result<bool, StoreError>;
}

pub fn hash_password(password: &str) -> Result<String, StoreError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| StoreError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_then_verify() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }

    #[test]
    fn test_garbage_hash_never_verifies() {
        assert!(!verify_password("admin", "not-a-phc-string"));
    }
}
