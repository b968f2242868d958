//! Plugin key and API key material
//!
//! Plugin keys identify a widget environment (`pk_` prefix, random body).
//! API keys carry an HMAC signature so malformed or forged keys are
//! rejected before any store lookup; the store match is still exact. API
//! secrets are verified against an argon2 hash from the tenant store.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const PLUGIN_KEY_PREFIX: &str = "pk_";
pub const API_KEY_PREFIX: &str = "ak_";
const API_KEY_VERSION: &str = "01";

/// Key manager for generation and pre-lookup validation
#[derive(Clone)]
pub struct KeyManager {
    hmac_secret: Vec<u8>,
}

impl KeyManager {
    pub fn new(secret: &str) -> Self {
        Self {
            hmac_secret: secret.as_bytes().to_vec(),
        }
    }

    /// Generate a plugin key for widget embeds.
    pub fn generate_plugin_key(&self) -> String {
        let random_bytes: [u8; 24] = rand::random();
        format!("{}{}", PLUGIN_KEY_PREFIX, hex::encode(random_bytes))
    }

    /// Generate a new API key. Returns the full key.
    pub fn generate_api_key(&self) -> Result<String, KeyError> {
        let key_id = Uuid::new_v4();
        let random_bytes: [u8; 16] = rand::random();
        let random_hex = hex::encode(random_bytes);

        // Payload: version + uuid + random
        let payload = format!("{}{}{}", API_KEY_VERSION, key_id.simple(), random_hex);

        let mut mac = HmacSha256::new_from_slice(&self.hmac_secret)
            .map_err(|_| KeyError::HmacInitFailed)?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();
        let sig_hex = hex::encode(&signature[..8]);

        Ok(format!("{}{}{}", API_KEY_PREFIX, payload, sig_hex))
    }

    /// Generate an API secret and its argon2 hash for storage.
    pub fn generate_api_secret(&self) -> Result<(String, String), KeyError> {
        let random_bytes: [u8; 32] = rand::random();
        let secret = hex::encode(random_bytes);
        let hash = hash_secret(&secret)?;
        Ok((secret, hash))
    }

    /// Check plugin key shape before hitting the store.
    pub fn plugin_key_format_ok(key: &str) -> bool {
        key.starts_with(PLUGIN_KEY_PREFIX) && key.len() > PLUGIN_KEY_PREFIX.len() + 16
    }

    /// Validate API key format and HMAC signature.
    pub fn validate_api_key(&self, key: &str) -> Result<bool, KeyError> {
        if !key.starts_with(API_KEY_PREFIX) {
            return Ok(false);
        }

        let key_body = &key[API_KEY_PREFIX.len()..];

        // Body: version(2) + uuid(32) + random(32) + signature(16) = 82 chars
        if key_body.len() != 82 {
            return Ok(false);
        }

        let payload = &key_body[..66];
        let provided_sig = &key_body[66..];

        let mut mac = HmacSha256::new_from_slice(&self.hmac_secret)
            .map_err(|_| KeyError::HmacInitFailed)?;
        mac.update(payload.as_bytes());
        let expected_sig = mac.finalize().into_bytes();
        let expected_sig_hex = hex::encode(&expected_sig[..8]);

        Ok(constant_time_compare(provided_sig, &expected_sig_hex))
    }
}

/// Hash an API secret with argon2 for storage.
pub fn hash_secret(secret: &str) -> Result<String, KeyError> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| KeyError::HashFailed)
}

/// Verify an API secret against its stored argon2 hash.
pub fn verify_secret(secret: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok()
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        // Dummy comparison to avoid length-based timing differences
        let dummy = vec![0u8; a.len()];
        let _ = a.as_bytes().ct_eq(&dummy);
        return false;
    }

    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("HMAC initialization failed")]
    HmacInitFailed,
    #[error("Secret hashing failed")]
    HashFailed,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_validate_api_key() {
        let manager = KeyManager::new("test-secret-key-32-chars-minimum!");

        let key = manager.generate_api_key().expect("Failed to generate key");
        assert!(key.starts_with(API_KEY_PREFIX));
        assert!(manager.validate_api_key(&key).expect("Validation failed"));
    }

    #[test]
    fn test_invalid_api_key() {
        let manager = KeyManager::new("test-secret-key-32-chars-minimum!");

        assert!(!manager.validate_api_key("garbage").expect("Validation failed"));

        let key = manager.generate_api_key().expect("Failed to generate key");
        let modified = format!("{}x", &key[..key.len() - 1]);
        assert!(!manager.validate_api_key(&modified).expect("Validation failed"));
    }

    #[test]
    fn test_plugin_key_shape() {
        let manager = KeyManager::new("test-secret-key-32-chars-minimum!");
        let key = manager.generate_plugin_key();
        assert!(KeyManager::plugin_key_format_ok(&key));
        assert!(!KeyManager::plugin_key_format_ok("pk_short"));
        assert!(!KeyManager::plugin_key_format_ok("nope"));
    }

    #[test]
    fn test_secret_hash_round_trip() {
        let manager = KeyManager::new("test-secret-key-32-chars-minimum!");
        let (secret, hash) = manager.generate_api_secret().expect("generate");
        assert!(verify_secret(&secret, &hash));
        assert!(!verify_secret("wrong", &hash));
        assert!(!verify_secret(&secret, "not-a-hash"));
    }
}
