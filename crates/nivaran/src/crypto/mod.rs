/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Field-level encryption for sensitive complainant data.
//!
//! Complainant name, phone, email, and address are encrypted at rest with
//! AES-256-GCM. The encrypted format is
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`, hex encoded. A keyed
//! HMAC-SHA256 hash of the phone (and email/name) enables equality lookup
//! without decryption.
//!
//! The key is 32 bytes, provided base64-encoded in the environment. When no
//! key is configured the cipher degrades to pass-through and a warning is
//! logged at startup; task bodies always handle cleartext in memory only.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{ConfigError, StorageError};

type HmacSha256 = Hmac<Sha256>;

/// Size of the AES-256-GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Complainant columns encrypted at rest.
pub const SENSITIVE_FIELDS: [&str; 4] = [
    "complainant_full_name",
    "complainant_phone",
    "complainant_email",
    "complainant_address",
];

/// Complainant columns that get a companion keyed lookup hash.
pub const HASHED_FIELDS: [&str; 3] = [
    "complainant_phone",
    "complainant_email",
    "complainant_full_name",
];

/// Symmetric cipher for sensitive fields.
#[derive(Clone)]
pub struct FieldCipher {
    key: Option<[u8; 32]>,
}

impl FieldCipher {
    /// Builds a cipher from the base64 key material in configuration.
    ///
    /// `None` produces a disabled cipher: values pass through unchanged
    /// and lookups hash the cleartext unkeyed.
    pub fn from_key(key_b64: Option<&str>) -> Result<Self, ConfigError> {
        let key = match key_b64 {
            Some(raw) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(raw.trim())
                    .map_err(|e| ConfigError::Invalid {
                        var: "DB_ENCRYPTION_KEY",
                        reason: format!("not valid base64: {}", e),
                    })?;
                let key: [u8; 32] = bytes.try_into().map_err(|_| ConfigError::Invalid {
                    var: "DB_ENCRYPTION_KEY",
                    reason: "key must be exactly 32 bytes".to_string(),
                })?;
                Some(key)
            }
            None => {
                warn!("DB_ENCRYPTION_KEY not set - field encryption disabled");
                None
            }
        };
        Ok(Self { key })
    }

    /// Generates fresh base64 key material.
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        base64::engine::general_purpose::STANDARD.encode(key)
    }

    pub fn enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Encrypts a field value. Pass-through when disabled.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, StorageError> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_string());
        };

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| StorageError::Encryption(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| StorageError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    /// Decrypts a field value. Pass-through when disabled or when the
    /// stored value predates encryption.
    pub fn decrypt(&self, stored: &str) -> Result<String, StorageError> {
        let Some(key) = &self.key else {
            return Ok(stored.to_string());
        };

        let Ok(bytes) = hex::decode(stored) else {
            // Legacy cleartext row
            return Ok(stored.to_string());
        };
        if bytes.len() <= NONCE_SIZE {
            return Err(StorageError::Encryption(
                "encrypted value too short".to_string(),
            ));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| StorageError::Encryption(e.to_string()))?;
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| StorageError::Encryption(format!("decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| StorageError::Encryption(format!("invalid utf-8: {}", e)))
    }

    /// Keyed hash for equality lookup without decryption.
    pub fn lookup_hash(&self, value: &str) -> String {
        match &self.key {
            Some(key) => {
                let mut mac =
                    <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(value.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            None => {
                let mut hasher = Sha256::new();
                hasher.update(value.as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> FieldCipher {
        let key = FieldCipher::generate_key();
        FieldCipher::from_key(Some(&key)).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let cipher = cipher();
        let plain = "+977-9812345678";
        let stored = cipher.encrypt(plain).unwrap();
        assert_ne!(stored, plain);
        assert_eq!(cipher.decrypt(&stored).unwrap(), plain);
    }

    #[test]
    fn test_each_encryption_uses_fresh_nonce() {
        let cipher = cipher();
        let a = cipher.encrypt("same value").unwrap();
        let b = cipher.encrypt("same value").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_decryption() {
        let a = cipher();
        let b = cipher();
        let stored = a.encrypt("secret").unwrap();
        assert!(b.decrypt(&stored).is_err());
    }

    #[test]
    fn test_disabled_cipher_passes_through() {
        let cipher = FieldCipher::from_key(None).unwrap();
        assert!(!cipher.enabled());
        assert_eq!(cipher.encrypt("value").unwrap(), "value");
        assert_eq!(cipher.decrypt("value").unwrap(), "value");
    }

    #[test]
    fn test_legacy_cleartext_passes_decrypt() {
        let cipher = cipher();
        // Not hex: stored before encryption was enabled
        assert_eq!(cipher.decrypt("John Doe").unwrap(), "John Doe");
    }

    #[test]
    fn test_lookup_hash_is_deterministic_and_keyed() {
        let cipher = cipher();
        let h1 = cipher.lookup_hash("+9779812345678");
        let h2 = cipher.lookup_hash("+9779812345678");
        assert_eq!(h1, h2);

        let other = super::FieldCipher::from_key(Some(&FieldCipher::generate_key())).unwrap();
        assert_ne!(h1, other.lookup_hash("+9779812345678"));
    }

    #[test]
    fn test_rejects_bad_key_material() {
        assert!(FieldCipher::from_key(Some("not base64!!")).is_err());
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 8]);
        assert!(FieldCipher::from_key(Some(&short)).is_err());
    }
}
