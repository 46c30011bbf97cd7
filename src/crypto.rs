//! Account token encryption using AES-256-GCM
//!
//! OAuth tokens are encrypted before they touch the accounts store. The key
//! is a 32-byte value stored base64-encoded in the configured key file and
//! generated on first start when the file does not exist.

use std::path::Path;

use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Error, Result};

/// Length of the nonce in bytes (96 bits for GCM)
const NONCE_LENGTH: usize = 12;

/// Token encryptor/decryptor
pub struct TokenEncryptor {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl TokenEncryptor {
    /// Load the key from `key_file`, creating a fresh one when missing.
    pub fn from_key_file(key_file: &Path) -> Result<Self> {
        let key_b64 = if key_file.exists() {
            std::fs::read_to_string(key_file)?.trim().to_string()
        } else {
            let rng = SystemRandom::new();
            let mut key_bytes = [0u8; 32];
            rng.fill(&mut key_bytes)
                .map_err(|_| Error::Encryption("Failed to generate encryption key".into()))?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(key_bytes);
            if let Some(parent) = key_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(key_file, &encoded)?;
            tracing::info!(path = %key_file.display(), "Generated new token encryption key");
            encoded
        };
        Self::from_base64_key(&key_b64)
    }

    /// Create a token encryptor from a base64-encoded 32-byte key
    pub fn from_base64_key(key_b64: &str) -> Result<Self> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_b64)
            .map_err(|e| Error::Encryption(format!("Invalid base64 key: {e}")))?;

        if key_bytes.len() != 32 {
            return Err(Error::Encryption(format!(
                "Invalid key length: expected 32 bytes, got {}",
                key_bytes.len()
            )));
        }

        let unbound_key = UnboundKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| Error::Encryption("Failed to create encryption key".into()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            rng: SystemRandom::new(),
        })
    }

    /// Encrypt a plaintext token
    ///
    /// Returns base64-encoded ciphertext with format: nonce || encrypted_data || tag
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::Encryption("Failed to generate nonce".into()))?;

        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        in_out.reserve(AES_256_GCM.tag_len());

        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::Encryption("Encryption failed".into()))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&in_out);

        Ok(base64::engine::general_purpose::STANDARD.encode(&result))
    }

    /// Decrypt a base64-encoded ciphertext
    ///
    /// Expects format: nonce || encrypted_data || tag
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String> {
        if ciphertext_b64.is_empty() {
            return Ok(String::new());
        }

        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(ciphertext_b64)
            .map_err(|e| Error::Encryption(format!("Invalid base64 ciphertext: {e}")))?;

        if ciphertext.len() < NONCE_LENGTH {
            return Err(Error::Encryption("Ciphertext too short".into()));
        }

        let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_LENGTH);
        let mut nonce_array = [0u8; NONCE_LENGTH];
        nonce_array.copy_from_slice(nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_array);

        let mut in_out = encrypted.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::Encryption("Decryption failed or data tampered".into()))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|e| Error::Encryption(format!("Invalid UTF-8 after decryption: {e}")))
    }
}

#[cfg(test)]
pub(crate) fn test_encryptor() -> TokenEncryptor {
    let key_b64 = base64::engine::general_purpose::STANDARD.encode(b"0123456789abcdef0123456789abcdef");
    TokenEncryptor::from_base64_key(&key_b64).expect("test key should be valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let encryptor = test_encryptor();

        let plaintext = "eyJhbGciOi...access_token...xyz";
        let ciphertext = encryptor.encrypt(plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);

        let decrypted = encryptor.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_string() {
        let encryptor = test_encryptor();
        assert_eq!(encryptor.encrypt("").unwrap(), "");
        assert_eq!(encryptor.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_tampered_ciphertext() {
        let encryptor = test_encryptor();
        let mut ciphertext = encryptor.encrypt("secret_token").unwrap();
        ciphertext.push('X');
        assert!(encryptor.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_key_file_created_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("encryption.key");

        let first = TokenEncryptor::from_key_file(&key_path).unwrap();
        assert!(key_path.exists());

        let ciphertext = first.encrypt("token").unwrap();
        let second = TokenEncryptor::from_key_file(&key_path).unwrap();
        assert_eq!(second.decrypt(&ciphertext).unwrap(), "token");
    }
}
