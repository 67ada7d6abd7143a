//! Caller authentication.
//!
//! Presented credentials are compared in constant time against SHA-256
//! digests of the configured keys, so neither content nor length leaks
//! through timing.

use crate::error::Error;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// When false every caller is anonymous for ordinary operations.
    pub enabled: bool,
    /// Accepted client API keys.
    pub api_keys: Vec<String>,
    /// Credential required for privileged operations.
    pub admin_key: Option<String>,
    /// Whether admin calls skip the circuit breaker as well as rate limiting.
    pub admin_bypasses_circuit: bool,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("enabled", &self.enabled)
            .field("api_keys", &self.api_keys.iter().map(|k| mask(k)).collect::<Vec<_>>())
            .field("admin_key", &self.admin_key.as_deref().map(mask))
            .field("admin_bypasses_circuit", &self.admin_bypasses_circuit)
            .finish()
    }
}

impl SecurityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_keys.push(key.into());
        self
    }

    pub fn with_admin_key(mut self, key: impl Into<String>) -> Self {
        self.admin_key = Some(key.into());
        self
    }

    pub fn with_admin_bypasses_circuit(mut self, bypass: bool) -> Self {
        self.admin_bypasses_circuit = bypass;
        self
    }
}

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Principal {
    /// Holder of a configured client key; `key_hint` is the masked key.
    Client { key_hint: String },
    Admin,
    /// Security disabled and no admin key presented.
    Anonymous,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        matches!(self, Principal::Admin)
    }
}

/// First four characters followed by `***`; shorter values are fully hidden.
pub fn mask(secret: &str) -> String {
    match secret.char_indices().nth(4) {
        Some((idx, _)) => format!("{}***", &secret[..idx]),
        None => "***".to_string(),
    }
}

type KeyDigest = [u8; 32];

fn digest(s: &str) -> KeyDigest {
    Sha256::digest(s.as_bytes()).into()
}

fn ct_eq(a: &KeyDigest, b: &KeyDigest) -> bool {
    a[..].ct_eq(&b[..]).into()
}

pub struct Authenticator {
    enabled: bool,
    client_keys: Vec<KeyDigest>,
    admin_key: Option<KeyDigest>,
}

impl Authenticator {
    pub fn new(cfg: &SecurityConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            client_keys: cfg
                .api_keys
                .iter()
                .filter(|k| !k.is_empty())
                .map(|k| digest(k))
                .collect(),
            admin_key: cfg.admin_key.as_deref().filter(|k| !k.is_empty()).map(digest),
        }
    }

    pub fn security_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_admin_key(&self) -> bool {
        self.admin_key.is_some()
    }

    fn is_admin(&self, presented: &KeyDigest) -> bool {
        self.admin_key.as_ref().is_some_and(|a| ct_eq(a, presented))
    }

    fn is_client(&self, presented: &KeyDigest) -> bool {
        // Visit every key so timing does not reveal which one matched.
        self.client_keys
            .iter()
            .fold(false, |hit, k| ct_eq(k, presented) | hit)
    }

    /// Identify the caller for an ordinary operation.
    pub fn authenticate(&self, presented: Option<&str>) -> Result<Principal> {
        let presented = presented.filter(|p| !p.is_empty());
        let d = presented.map(digest);

        if d.as_ref().is_some_and(|d| self.is_admin(d)) {
            return Ok(Principal::Admin);
        }
        if !self.enabled {
            return Ok(Principal::Anonymous);
        }
        match (presented, d) {
            (Some(p), Some(d)) if self.is_client(&d) => Ok(Principal::Client { key_hint: mask(p) }),
            (Some(p), _) => {
                debug!(key = %mask(p), "rejected invalid API key");
                Err(Error::authentication("invalid API key"))
            }
            (None, _) => Err(Error::authentication("missing API key")),
        }
    }

    /// Require the admin credential, whether or not security is enabled.
    pub fn authorize_admin(&self, presented: Option<&str>) -> Result<Principal> {
        if self.admin_key.is_none() {
            return Err(Error::forbidden("privileged operations disabled: no admin key configured"));
        }
        let Some(p) = presented.filter(|p| !p.is_empty()) else {
            return Err(Error::authentication("missing admin key"));
        };
        let d = digest(p);
        if self.is_admin(&d) {
            return Ok(Principal::Admin);
        }
        if self.is_client(&d) {
            return Err(Error::forbidden("operation requires the admin key"));
        }
        debug!(key = %mask(p), "rejected invalid admin key");
        Err(Error::authentication("invalid admin key"))
    }
}
