use super::EncryptedCredential;
use crate::error::{Error, ErrorContext};
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistence for the single encrypted credential record.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    async fn load(&self) -> Result<Option<EncryptedCredential>>;

    /// Replace the stored record as a whole.
    async fn save(&self, record: &EncryptedCredential) -> Result<()>;

    /// Returns whether a record existed.
    async fn clear(&self) -> Result<bool>;

    fn describe(&self) -> String;
}

/// Process-local storage; the record is lost on restart.
#[derive(Default)]
pub struct MemoryCredentialBackend {
    slot: Mutex<Option<EncryptedCredential>>,
}

impl MemoryCredentialBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialBackend for MemoryCredentialBackend {
    async fn load(&self) -> Result<Option<EncryptedCredential>> {
        Ok(self.slot.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    async fn save(&self, record: &EncryptedCredential) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(record.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<bool> {
        Ok(self.slot.lock().unwrap_or_else(|p| p.into_inner()).take().is_some())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// JSON record on disk, replaced via write-to-temp then rename.
pub struct FileCredentialBackend {
    path: PathBuf,
}

impl FileCredentialBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "credential".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CredentialBackend for FileCredentialBackend {
    async fn load(&self) -> Result<Option<EncryptedCredential>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_str(&text).map_err(|e| {
            Error::decryption_with_context(
                format!("stored credential record is unreadable: {e}"),
                ErrorContext::new()
                    .with_details(self.path.display().to_string())
                    .with_source("credential_store"),
            )
        })?;
        Ok(Some(record))
    }

    async fn save(&self, record: &EncryptedCredential) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(record)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, body).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
