use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::api::middleware::AppError;

const NONCE_LEN: usize = 12;

/// AES-256-GCM encryption for credentials at rest.
///
/// Blobs are laid out as `nonce (12 bytes) || ciphertext`. The key is taken
/// directly from the secret when it is a base64-encoded 32-byte key, otherwise
/// it is the SHA-256 digest of the secret.
pub struct EncryptionService {
    key: [u8; 32],
}

impl EncryptionService {
    pub fn new(secret: &str) -> Result<Self, AppError> {
        if secret.is_empty() {
            return Err(AppError::Validation("Encryption secret cannot be empty".to_string()));
        }

        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(secret) {
            if decoded.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&decoded);
                return Ok(Self { key });
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AppError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let encrypted = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| AppError::Internal(format!("Encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + encrypted.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&encrypted);
        Ok(blob)
    }

    /// Fails with `AppError::Decode` on truncated blobs, tampering or a key mismatch
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, AppError> {
        if blob.len() <= NONCE_LEN {
            return Err(AppError::Decode(format!(
                "encrypted blob is too short ({} bytes)",
                blob.len()
            )));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AppError::Decode("authentication tag mismatch".to_string()))
    }
}
