use crate::error::{Error, ErrorContext};
use crate::Result;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-256 key size in bytes.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce size in bytes.
pub const NONCE_LEN: usize = 12;

/// Decrypted provider key; wiped from memory on drop.
pub type SecretString = Zeroizing<String>;

/// Symmetric key sealing the provider credential.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(Error::configuration_with_context(
                format!("encryption key must be {KEY_LEN} bytes, got {}", bytes.len()),
                ErrorContext::new()
                    .with_field_path("credential.encryption_key")
                    .with_source("master_key"),
            ));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    pub fn from_base64(b64: &str) -> Result<Self> {
        let bytes = Zeroizing::new(STANDARD.decode(b64.trim()).map_err(|e| {
            Error::configuration_with_context(
                format!("encryption key is not valid base64: {e}"),
                ErrorContext::new()
                    .with_field_path("credential.encryption_key")
                    .with_source("master_key"),
            )
        })?);
        Self::from_bytes(&bytes)
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.bytes))
    }

    /// Non-secret fingerprint: first 8 bytes of SHA-256, hex encoded.
    pub fn key_id(&self) -> String {
        let digest = Sha256::digest(self.bytes);
        hex::encode(&digest[..8])
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.bytes.into())
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key_id", &self.key_id())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The single stored provider credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedCredential {
    /// Base64 AES-256-GCM ciphertext including the auth tag.
    pub ciphertext: String,
    /// Base64 96-bit nonce.
    pub nonce: String,
    pub created_at_ms: u64,
    /// Incremented on every `set_key`.
    pub version: u64,
    /// Fingerprint of the key that sealed this record.
    pub key_id: String,
}

fn crypto_ctx() -> ErrorContext {
    ErrorContext::new().with_source("credential_store")
}

impl EncryptedCredential {
    /// Seal `plaintext` under `key` with a fresh random nonce.
    pub fn seal(plaintext: &str, key: &MasterKey, version: u64) -> Result<Self> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = key
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| Error::encryption_with_context(e.to_string(), crypto_ctx()))?;

        Ok(Self {
            ciphertext: STANDARD.encode(ciphertext),
            nonce: STANDARD.encode(nonce_bytes),
            created_at_ms: crate::metrics::now_ms(),
            version,
            key_id: key.key_id(),
        })
    }

    /// Decrypt under `key`. Never returns wrong plaintext: any tampering or a
    /// different key fails authentication.
    pub fn open(&self, key: &MasterKey) -> Result<SecretString> {
        let ciphertext = STANDARD.decode(&self.ciphertext).map_err(|e| {
            Error::decryption_with_context(format!("invalid ciphertext encoding: {e}"), crypto_ctx())
        })?;
        let nonce = STANDARD.decode(&self.nonce).map_err(|e| {
            Error::decryption_with_context(format!("invalid nonce encoding: {e}"), crypto_ctx())
        })?;
        if nonce.len() != NONCE_LEN {
            return Err(Error::decryption_with_context(
                format!("nonce must be {NONCE_LEN} bytes, got {}", nonce.len()),
                crypto_ctx(),
            ));
        }

        let plaintext = key
            .cipher()
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| {
                let current = key.key_id();
                let (message, details) = if current != self.key_id {
                    (
                        "encryption key changed since the credential was stored",
                        format!("sealed under key {}, current key is {}", self.key_id, current),
                    )
                } else {
                    (
                        "stored credential failed authentication (corrupted)",
                        format!("key {current}, record version {}", self.version),
                    )
                };
                Error::decryption_with_context(message, crypto_ctx().with_details(details))
            })?;

        let text = String::from_utf8(plaintext).map_err(|e| {
            let mut bytes = e.into_bytes();
            bytes.zeroize();
            Error::decryption_with_context("decrypted credential is not UTF-8", crypto_ctx())
        })?;
        Ok(Zeroizing::new(text))
    }
}
