//! Encrypted storage of the upstream provider key.
//!
//! The provider key is sealed with AES-256-GCM under a 32-byte master key
//! and kept as a single [`EncryptedCredential`] record. Rotating the master
//! key without re-storing the credential makes the record unreadable; that
//! surfaces as [`Error::Decryption`](crate::Error::Decryption) naming both key
//! fingerprints, never as "no key configured".
//!
//! Master key resolution order: `credential.encryption_key` (base64), then
//! the OS keyring entry `speech-gateway` / `master-key`.

mod backend;
mod cipher;
mod store;

pub use backend::{CredentialBackend, FileCredentialBackend, MemoryCredentialBackend};
pub use cipher::{EncryptedCredential, MasterKey, SecretString, KEY_LEN, NONCE_LEN};
pub use store::{CredentialStatus, CredentialStore, KeyState};

use crate::Result;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

pub const KEYRING_SERVICE: &str = "speech-gateway";
pub const KEYRING_USER: &str = "master-key";

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Base64 of 32 random bytes.
    pub encryption_key: Option<String>,
    /// Where the sealed record lives; in-memory only when unset.
    pub store_path: Option<PathBuf>,
    /// Fall back to the OS keyring when no key is configured.
    pub use_keyring: bool,
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "[REDACTED]"))
            .field("store_path", &self.store_path)
            .field("use_keyring", &self.use_keyring)
            .finish()
    }
}

impl CredentialConfig {
    pub fn with_encryption_key(mut self, b64: impl Into<String>) -> Self {
        self.encryption_key = Some(b64.into());
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_keyring(mut self, enabled: bool) -> Self {
        self.use_keyring = enabled;
        self
    }

    /// Resolve the master key. Never fails: problems become `KeyState`
    /// variants and surface on first use of the store.
    pub fn resolve_key(&self) -> KeyState {
        if let Some(ref b64) = self.encryption_key {
            return match MasterKey::from_base64(b64) {
                Ok(k) => KeyState::Ready(k),
                Err(e) => {
                    warn!(error = %e, "configured encryption key rejected");
                    KeyState::Invalid(e.to_string())
                }
            };
        }
        if self.use_keyring {
            match keyring_key() {
                Ok(Some(k)) => return KeyState::Ready(k),
                Ok(None) => debug!("no master key in OS keyring"),
                Err(reason) => return KeyState::Invalid(reason),
            }
        }
        KeyState::Missing
    }

    pub fn backend(&self) -> Arc<dyn CredentialBackend> {
        match self.store_path {
            Some(ref path) => Arc::new(FileCredentialBackend::new(path)),
            None => Arc::new(MemoryCredentialBackend::new()),
        }
    }

    /// Resolve the key, pick the backend and load any stored record.
    pub async fn open_store(&self) -> Result<CredentialStore> {
        CredentialStore::open(self.resolve_key(), self.backend()).await
    }
}

fn keyring_key() -> std::result::Result<Option<MasterKey>, String> {
    let entry = match Entry::new(KEYRING_SERVICE, KEYRING_USER) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "OS keyring unavailable");
            return Ok(None);
        }
    };
    match entry.get_password() {
        Ok(b64) => MasterKey::from_base64(&b64)
            .map(Some)
            .map_err(|e| format!("keyring master key rejected: {e}")),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => {
            debug!(error = %e, "OS keyring lookup failed");
            Ok(None)
        }
    }
}

/// Store `key` in the OS keyring for later resolution.
pub fn store_in_keyring(key: &MasterKey) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER).map_err(keyring_error)?;
    entry
        .set_password(key.to_base64().as_str())
        .map_err(keyring_error)
}

fn keyring_error(e: keyring::Error) -> crate::Error {
    crate::Error::configuration_with_context(
        format!("OS keyring error: {e}"),
        crate::ErrorContext::new().with_source("keyring"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_key_wins() {
        let key = MasterKey::generate();
        let cfg = CredentialConfig::default().with_encryption_key(key.to_base64().as_str());
        match cfg.resolve_key() {
            KeyState::Ready(k) => assert_eq!(k.key_id(), key.key_id()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_configured_key_is_invalid_not_missing() {
        let cfg = CredentialConfig::default().with_encryption_key("c2hvcnQ=");
        assert!(matches!(cfg.resolve_key(), KeyState::Invalid(_)));
    }

    #[test]
    fn test_no_key_without_keyring_is_missing() {
        let cfg = CredentialConfig::default().with_keyring(false);
        assert!(matches!(cfg.resolve_key(), KeyState::Missing));
    }

    #[test]
    fn test_debug_redacts_key() {
        let cfg = CredentialConfig::default().with_encryption_key("super-secret");
        assert!(!format!("{cfg:?}").contains("super-secret"));
    }

    #[tokio::test]
    async fn test_open_store_with_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CredentialConfig::default()
            .with_encryption_key(MasterKey::generate().to_base64().as_str())
            .with_store_path(dir.path().join("cred.json"));
        let store = cfg.open_store().await.unwrap();
        store.set_key("abc").await.unwrap();

        let again = cfg.open_store().await.unwrap();
        assert_eq!(again.get_key().unwrap().unwrap().as_str(), "abc");
    }
}
