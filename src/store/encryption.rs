//! Content-at-rest encryption
//!
//! Message content is transparently encrypted on write and decrypted on read
//! when an encryptor is installed. The stored form is
//! `base64(nonce) ":" base64(ciphertext)`; the `is_encrypted` column records
//! which rows are encrypted so keys can be rotated without rewriting history.

use crate::error::{EngineError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};

/// Symmetric encryption applied to content rows by the store
pub trait ContentEncryptor: Send + Sync {
    /// Whether rows written through this encryptor are encrypted at all
    fn is_enabled(&self) -> bool;

    fn encrypt(&self, plaintext: &str) -> Result<String>;

    fn decrypt(&self, stored: &str) -> Result<String>;
}

/// AES-256-GCM content encryptor
pub struct AesContentEncryptor {
    cipher: Aes256Gcm,
}

impl AesContentEncryptor {
    pub fn new(key_bytes: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Derive the key from a passphrase by SHA-256
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self::new(&key)
    }

    /// Load a base64-encoded 32-byte key
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| EngineError::Configuration(format!("invalid encryption key: {}", e)))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            EngineError::Configuration("encryption key must be 32 bytes".to_string())
        })?;
        Ok(Self::new(&key))
    }
}

impl ContentEncryptor for AesContentEncryptor {
    fn is_enabled(&self) -> bool {
        true
    }

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| EngineError::Serialization(format!("encryption failed: {}", e)))?;
        Ok(format!(
            "{}:{}",
            STANDARD.encode(nonce_bytes),
            STANDARD.encode(&ciphertext)
        ))
    }

    fn decrypt(&self, stored: &str) -> Result<String> {
        let (nonce_part, cipher_part) = stored.split_once(':').ok_or_else(|| {
            EngineError::Serialization("encrypted content missing nonce separator".to_string())
        })?;
        let nonce_bytes = STANDARD
            .decode(nonce_part)
            .map_err(|e| EngineError::Serialization(format!("invalid nonce encoding: {}", e)))?;
        if nonce_bytes.len() != 12 {
            return Err(EngineError::Serialization(
                "encrypted content nonce must be 12 bytes".to_string(),
            ));
        }
        let ciphertext = STANDARD
            .decode(cipher_part)
            .map_err(|e| EngineError::Serialization(format!("invalid content encoding: {}", e)))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| EngineError::Serialization(format!("decryption failed: {}", e)))?;
        String::from_utf8(plaintext)
            .map_err(|e| EngineError::Serialization(format!("decrypted content not UTF-8: {}", e)))
    }
}

/// Pass-through encryptor used when content encryption is disabled
pub struct NoopEncryptor;

impl ContentEncryptor for NoopEncryptor {
    fn is_enabled(&self) -> bool {
        false
    }

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, stored: &str) -> Result<String> {
        Ok(stored.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let enc = AesContentEncryptor::from_passphrase("correct horse battery staple");
        for plaintext in [
            "",
            "MSH|^~\\&|LAB|FAC|EHR|FAC|202401011200||ADT^A01|1|P|2.5.1",
            "unicode: héllo wörld ✓",
        ] {
            let stored = enc.encrypt(plaintext).unwrap();
            assert_ne!(stored, plaintext);
            assert!(stored.contains(':'));
            assert_eq!(enc.decrypt(&stored).unwrap(), plaintext);
        }
    }

    #[test]
    fn encryption_is_nondeterministic() {
        let enc = AesContentEncryptor::from_passphrase("k");
        let a = enc.encrypt("same input").unwrap();
        let b = enc.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let enc = AesContentEncryptor::from_passphrase("k");
        assert!(enc.decrypt("no separator").is_err());
        assert!(enc.decrypt("!!!:###").is_err());

        // valid encoding, wrong key
        let other = AesContentEncryptor::from_passphrase("different");
        let stored = other.encrypt("secret").unwrap();
        assert!(enc.decrypt(&stored).is_err());
    }

    #[test]
    fn noop_passes_through() {
        let enc = NoopEncryptor;
        assert!(!enc.is_enabled());
        assert_eq!(enc.encrypt("x").unwrap(), "x");
        assert_eq!(enc.decrypt("x").unwrap(), "x");
    }
}
