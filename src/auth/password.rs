/**
 * Password Hashing
 *
 * PBKDF2-HMAC-SHA256 with 10,000 rounds. Hashing is the only CPU-bound
 * section of the system worth mentioning, so it runs on the blocking pool
 * behind a semaphore bound instead of the cooperative executor.
 *
 * Stored form: `pbkdf2_sha256$<rounds>$<salt_b64>$<dk_b64>`.
 */

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::ApiError;

const ROUNDS: u32 = 10_000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const SCHEME: &str = "pbkdf2_sha256";

/// Bounded off-main-path password hasher.
#[derive(Clone)]
pub struct PasswordHasher {
    permits: Arc<Semaphore>,
}

impl PasswordHasher {
    /// Create a hasher allowing at most `max_concurrent` derivations at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Hash a password on the blocking pool.
    pub async fn hash(&self, password: String) -> Result<String, ApiError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ApiError::internal(e))?;
        tokio::task::spawn_blocking(move || hash_sync(&password))
            .await
            .map_err(|e| ApiError::internal(e))
    }

    /// Verify a password against its stored hash on the blocking pool.
    pub async fn verify(&self, password: String, stored: String) -> Result<bool, ApiError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ApiError::internal(e))?;
        tokio::task::spawn_blocking(move || verify_sync(&password, &stored))
            .await
            .map_err(|e| ApiError::internal(e))
    }
}

fn hash_sync(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut dk = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, ROUNDS, &mut dk);

    format!(
        "{SCHEME}${ROUNDS}${}${}",
        STANDARD_NO_PAD.encode(salt),
        STANDARD_NO_PAD.encode(dk)
    )
}

fn verify_sync(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(rounds), Some(salt), Some(expected)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if scheme != SCHEME || parts.next().is_some() {
        return false;
    }
    let Ok(rounds) = rounds.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (
        STANDARD_NO_PAD.decode(salt),
        STANDARD_NO_PAD.decode(expected),
    ) else {
        return false;
    };

    let mut dk = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, rounds, &mut dk);
    constant_time_eq(&dk, &expected)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_and_verify() {
        let hasher = PasswordHasher::new(4);
        let stored = hasher.hash("hunter2".to_string()).await.unwrap();
        assert!(stored.starts_with("pbkdf2_sha256$10000$"));

        assert!(hasher
            .verify("hunter2".to_string(), stored.clone())
            .await
            .unwrap());
        assert!(!hasher
            .verify("hunter3".to_string(), stored)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_hashes_are_salted() {
        let hasher = PasswordHasher::new(4);
        let a = hasher.hash("same".to_string()).await.unwrap();
        let b = hasher.hash("same".to_string()).await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_verify_rejects_malformed_hash() {
        assert!(!verify_sync("pw", "not-a-hash"));
        assert!(!verify_sync("pw", "bcrypt$12$abc$def"));
        assert!(!verify_sync("pw", "pbkdf2_sha256$zzz$a$b"));
    }
}
