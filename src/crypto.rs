//! Credential encryption using AES-256-GCM
//!
//! Connection secrets (the upstream API key and the webhook shared secret)
//! are stored encrypted. Ciphertexts carry a version byte and the nonce, and
//! are bound to their owning connection and field through additional
//! authenticated data, so a row copied between connections fails to decrypt.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::Engine;
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// Secure wrapper for the symmetric key with zeroization on drop
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    /// Create a key from raw bytes; must be exactly 32 bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(
                "expected 32 bytes of key material".to_string(),
            ));
        }
        Ok(CryptoKey(bytes))
    }

    /// Decode a key from its base64 environment representation
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")))?;
        Self::new(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED || ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

fn field_aad(connection_id: Uuid, field: &str) -> Vec<u8> {
    format!("{connection_id}|{field}").into_bytes()
}

/// Encrypt a connection secret bound to its owning row and field name
pub fn encrypt_secret(
    key: &CryptoKey,
    connection_id: Uuid,
    field: &str,
    plaintext: &str,
) -> Result<Vec<u8>, CryptoError> {
    encrypt_bytes(key, &field_aad(connection_id, field), plaintext.as_bytes())
}

/// Decrypt a connection secret previously produced by [`encrypt_secret`]
pub fn decrypt_secret(
    key: &CryptoKey,
    connection_id: Uuid,
    field: &str,
    ciphertext: &[u8],
) -> Result<String, CryptoError> {
    let bytes = decrypt_bytes(key, &field_aad(connection_id, field), ciphertext)?;
    String::from_utf8(bytes)
        .map_err(|e| CryptoError::DecryptionFailed(format!("invalid UTF-8: {e}")))
}
