use super::{CredentialBackend, EncryptedCredential, MasterKey, SecretString};
use crate::error::{Error, ErrorContext};
use crate::Result;
use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Availability of the master key.
#[derive(Debug, Clone)]
pub enum KeyState {
    Ready(MasterKey),
    Missing,
    /// Configured but unusable; carries the reason.
    Invalid(String),
}

impl KeyState {
    fn key(&self) -> std::result::Result<&MasterKey, String> {
        match self {
            KeyState::Ready(k) => Ok(k),
            KeyState::Missing => Err("no encryption key configured".to_string()),
            KeyState::Invalid(reason) => Err(format!("encryption key is invalid: {reason}")),
        }
    }
}

/// Metadata about the stored credential, safe to expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    pub backend: String,
    pub key_id: Option<String>,
    pub stored: bool,
    pub decryptable: bool,
    pub version: Option<u64>,
    pub created_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

/// Holder of the single provider credential.
///
/// Readers load the current record through an atomic pointer swap, so a
/// concurrent `set_key` is observed either entirely or not at all.
///
/// A persisted record that cannot even be parsed does not stop the store
/// from opening: it is held as a fault, reads fail with
/// [`Error::Decryption`], and the next `set_key` or `clear_key` replaces it.
pub struct CredentialStore {
    key: KeyState,
    backend: Arc<dyn CredentialBackend>,
    current: ArcSwapOption<EncryptedCredential>,
    load_fault: ArcSwapOption<String>,
    writer: tokio::sync::Mutex<()>,
}

impl CredentialStore {
    /// Load any persisted record from `backend`.
    pub async fn open(key: KeyState, backend: Arc<dyn CredentialBackend>) -> Result<Self> {
        let (record, load_fault) = match backend.load().await {
            Ok(record) => (record, None),
            Err(Error::Decryption { message, .. }) => {
                error!(
                    fault = "decryption",
                    backend = %backend.describe(),
                    error = %message,
                    "stored credential record unreadable; set or clear the provider key to recover"
                );
                (None, Some(Arc::new(message)))
            }
            Err(e) => return Err(e),
        };
        if let Some(ref rec) = record {
            info!(
                backend = %backend.describe(),
                version = rec.version,
                key_id = %rec.key_id,
                "loaded stored credential"
            );
        }
        Ok(Self {
            key,
            backend,
            current: ArcSwapOption::from(record.map(Arc::new)),
            load_fault: ArcSwapOption::from(load_fault),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn key_state(&self) -> &KeyState {
        &self.key
    }

    /// Encrypt and atomically replace the stored credential.
    pub async fn set_key(&self, plaintext: &str) -> Result<()> {
        let key = self.key.key().map_err(|reason| {
            error!(fault = "encryption", %reason, "cannot store provider key");
            Error::encryption_with_context(
                reason,
                ErrorContext::new()
                    .with_field_path("credential.encryption_key")
                    .with_source("credential_store"),
            )
        })?;

        let _guard = self.writer.lock().await;
        let version = self.current.load_full().map_or(0, |r| r.version) + 1;
        let record = EncryptedCredential::seal(plaintext, key, version).map_err(|e| {
            error!(fault = "encryption", error = %e, "sealing provider key failed");
            e
        })?;
        self.backend.save(&record).await?;
        self.current.store(Some(Arc::new(record)));
        self.load_fault.store(None);
        info!(version, key_id = %key.key_id(), "provider key updated");
        Ok(())
    }

    /// Decrypt without logging.
    fn decrypt(&self) -> Result<Option<SecretString>> {
        let Some(record) = self.current.load_full() else {
            return match self.load_fault.load_full() {
                Some(fault) => Err(Error::decryption_with_context(
                    fault.as_str(),
                    ErrorContext::new()
                        .with_details(self.backend.describe())
                        .with_source("credential_store"),
                )),
                None => Ok(None),
            };
        };
        let key = self.key.key().map_err(|reason| {
            Error::decryption_with_context(
                reason,
                ErrorContext::new()
                    .with_field_path("credential.encryption_key")
                    .with_source("credential_store"),
            )
        })?;
        record.open(key).map(Some)
    }

    /// Decrypt the current credential.
    ///
    /// `Ok(None)` means nothing is stored. A record that does not decrypt
    /// under the current key is an error, never treated as absent.
    pub fn get_key(&self) -> Result<Option<SecretString>> {
        self.decrypt().map_err(|e| {
            error!(fault = "decryption", error = %e, "stored provider key unreadable");
            e
        })
    }

    /// True only when a credential is stored and decrypts. Never fails.
    pub fn has_key(&self) -> bool {
        matches!(self.decrypt(), Ok(Some(_)))
    }

    /// Delete the stored credential. Returns whether one existed.
    pub async fn clear_key(&self) -> Result<bool> {
        let _guard = self.writer.lock().await;
        let existed = self.backend.clear().await?;
        let had = self.current.swap(None).is_some();
        let faulted = self.load_fault.swap(None).is_some();
        let removed = existed || had || faulted;
        if removed {
            info!("provider key cleared");
        }
        Ok(removed)
    }

    /// The sealed record, without decrypting it.
    pub fn record(&self) -> Option<Arc<EncryptedCredential>> {
        self.current.load_full()
    }

    pub fn status(&self) -> CredentialStatus {
        let record = self.record();
        let (decryptable, fault) = match self.decrypt() {
            Ok(Some(_)) => (true, None),
            Ok(None) => (false, None),
            Err(e) => (false, Some(e.to_string())),
        };
        CredentialStatus {
            backend: self.backend.describe(),
            key_id: match &self.key {
                KeyState::Ready(k) => Some(k.key_id()),
                _ => None,
            },
            stored: record.is_some() || self.load_fault.load().is_some(),
            decryptable,
            version: record.as_ref().map(|r| r.version),
            created_at_ms: record.as_ref().map(|r| r.created_at_ms),
            fault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{FileCredentialBackend, MemoryCredentialBackend};
    use crate::error::ErrorKind;
    use base64::{engine::general_purpose::STANDARD, Engine};

    async fn memory_store(key: &MasterKey) -> (CredentialStore, Arc<MemoryCredentialBackend>) {
        let backend = Arc::new(MemoryCredentialBackend::new());
        let store = CredentialStore::open(KeyState::Ready(key.clone()), backend.clone())
            .await
            .unwrap();
        (store, backend)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let key = MasterKey::generate();
        let (store, _) = memory_store(&key).await;
        assert!(store.get_key().unwrap().is_none());
        assert!(!store.has_key());

        store.set_key("xi-api-key-123").await.unwrap();
        assert_eq!(store.get_key().unwrap().unwrap().as_str(), "xi-api-key-123");
        assert!(store.has_key());
        assert_eq!(store.record().unwrap().version, 1);

        store.set_key("xi-api-key-456").await.unwrap();
        assert_eq!(store.get_key().unwrap().unwrap().as_str(), "xi-api-key-456");
        assert_eq!(store.record().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_missing_key_is_encryption_error() {
        let store = CredentialStore::open(KeyState::Missing, Arc::new(MemoryCredentialBackend::new()))
            .await
            .unwrap();
        let err = store.set_key("abc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Encryption);
        assert_eq!(err.code(), "CREDENTIAL_FAULT");

        let store = CredentialStore::open(
            KeyState::Invalid("wrong length".into()),
            Arc::new(MemoryCredentialBackend::new()),
        )
        .await
        .unwrap();
        assert_eq!(store.set_key("abc").await.unwrap_err().kind(), ErrorKind::Encryption);
    }

    #[tokio::test]
    async fn test_corrupted_ciphertext_is_decryption_error() {
        let key = MasterKey::generate();
        let (store, backend) = memory_store(&key).await;
        store.set_key("secret").await.unwrap();

        let mut rec = store.record().unwrap().as_ref().clone();
        let mut raw = STANDARD.decode(&rec.ciphertext).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        rec.ciphertext = STANDARD.encode(raw);
        backend.save(&rec).await.unwrap();

        let reopened = CredentialStore::open(KeyState::Ready(key), backend).await.unwrap();
        let err = reopened.get_key().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decryption);
        assert!(!reopened.has_key());
    }

    #[tokio::test]
    async fn test_rotated_key_is_decryption_error_not_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");
        let old = MasterKey::generate();
        let store = CredentialStore::open(
            KeyState::Ready(old.clone()),
            Arc::new(FileCredentialBackend::new(&path)),
        )
        .await
        .unwrap();
        store.set_key("secret").await.unwrap();

        let new = MasterKey::generate();
        let rotated = CredentialStore::open(
            KeyState::Ready(new.clone()),
            Arc::new(FileCredentialBackend::new(&path)),
        )
        .await
        .unwrap();
        let err = rotated.get_key().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decryption);
        let msg = err.to_string();
        assert!(msg.contains(&old.key_id()) && msg.contains(&new.key_id()), "{msg}");

        let status = rotated.status();
        assert!(status.stored);
        assert!(!status.decryptable);
        assert!(status.fault.is_some());

        // Overwriting under the new key recovers.
        rotated.set_key("fresh").await.unwrap();
        assert_eq!(rotated.get_key().unwrap().unwrap().as_str(), "fresh");
        assert_eq!(rotated.record().unwrap().version, 2);
    }

    struct ErrorEvents(Arc<std::sync::atomic::AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorEvents {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::ERROR {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_status_polling_does_not_log_faults() {
        use tracing_subscriber::layer::SubscriberExt;

        let (store, backend) = memory_store(&MasterKey::generate()).await;
        store.set_key("secret").await.unwrap();
        let rotated = CredentialStore::open(KeyState::Ready(MasterKey::generate()), backend)
            .await
            .unwrap();

        let errors = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(ErrorEvents(Arc::clone(&errors)));
        tracing::subscriber::with_default(subscriber, || {
            for _ in 0..100 {
                assert!(!rotated.has_key());
                assert!(rotated.status().fault.is_some());
            }
            assert_eq!(errors.load(std::sync::atomic::Ordering::SeqCst), 0);

            assert!(rotated.get_key().is_err());
            assert_eq!(errors.load(std::sync::atomic::Ordering::SeqCst), 1);
        });
    }

    #[tokio::test]
    async fn test_unparseable_file_opens_faulted_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");
        std::fs::write(&path, "{ truncated").unwrap();
        let key = MasterKey::generate();

        let store = CredentialStore::open(
            KeyState::Ready(key.clone()),
            Arc::new(FileCredentialBackend::new(&path)),
        )
        .await
        .unwrap();
        assert_eq!(store.get_key().unwrap_err().kind(), ErrorKind::Decryption);
        assert!(!store.has_key());
        let status = store.status();
        assert!(status.stored && !status.decryptable);
        assert!(status.fault.is_some());

        store.set_key("fresh").await.unwrap();
        assert_eq!(store.get_key().unwrap().unwrap().as_str(), "fresh");
        assert_eq!(store.record().unwrap().version, 1);
        assert!(store.status().fault.is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_unparseable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");
        std::fs::write(&path, "garbage").unwrap();
        let store = CredentialStore::open(
            KeyState::Ready(MasterKey::generate()),
            Arc::new(FileCredentialBackend::new(&path)),
        )
        .await
        .unwrap();

        assert!(store.clear_key().await.unwrap());
        assert!(!path.exists());
        assert!(store.get_key().unwrap().is_none());
        assert!(!store.status().stored);
    }

    #[tokio::test]
    async fn test_clear_key() {
        let key = MasterKey::generate();
        let (store, backend) = memory_store(&key).await;
        assert!(!store.clear_key().await.unwrap());
        store.set_key("secret").await.unwrap();
        assert!(store.clear_key().await.unwrap());
        assert!(store.get_key().unwrap().is_none());
        assert!(backend.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_readers_never_see_torn_records() {
        let key = MasterKey::generate();
        let (store, _) = memory_store(&key).await;
        let store = Arc::new(store);
        store.set_key("value-0").await.unwrap();

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 1..50 {
                    store.set_key(&format!("value-{i}")).await.unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let v = store.get_key().unwrap().unwrap();
                        assert!(v.starts_with("value-"));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for r in readers {
            r.await.unwrap();
        }
        assert_eq!(store.record().unwrap().version, 50);
    }
}
