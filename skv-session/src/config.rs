//! # Configuration
//!
//! Purpose: Describe the shared credential, the transport security policy,
//! pool tuning, and statically known instances in one JSON document.
//!
//! ```json
//! {
//!   "credential": { "secret": "..." },
//!   "security": { "mode": "ca_certificate", "path": "/etc/skv/server-ca.pem" },
//!   "instances": [
//!     { "project": "acme", "location": "us-central1", "instance_id": "sessions",
//!       "host": "10.0.0.3", "port": 6378 }
//!   ]
//! }
//! ```
//!
//! `pool` may be omitted; its defaults are the fixed tuning of the pool cache.
//! The `SKV_SHARED_SECRET` environment variable overrides the file's secret.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use skv_client::{TlsContext, TlsError};

use crate::cache::PoolTuning;
use crate::error::{SessionError, SessionResult};
use crate::instance::{InstanceName, StaticInstanceResolver};

/// Environment variable that replaces `credential.secret`.
pub const SECRET_ENV: &str = "SKV_SHARED_SECRET";

/// How connections to every instance are secured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransportSecurity {
    /// No TLS.
    Plaintext,
    /// TLS that accepts any server certificate. Test environments only.
    InsecureTrustAll,
    /// TLS verified against the bundled public roots.
    SystemRoots,
    /// TLS verified against a single CA certificate.
    CaCertificate { path: PathBuf },
}

impl Default for TransportSecurity {
    fn default() -> Self {
        TransportSecurity::SystemRoots
    }
}

impl TransportSecurity {
    /// Builds the TLS context for a new pool, `None` for plaintext.
    pub fn tls_context(&self) -> Result<Option<TlsContext>, TlsError> {
        match self {
            TransportSecurity::Plaintext => Ok(None),
            TransportSecurity::InsecureTrustAll => TlsContext::insecure_trust_all().map(Some),
            TransportSecurity::SystemRoots => TlsContext::with_system_roots().map(Some),
            TransportSecurity::CaCertificate { path } => {
                TlsContext::with_ca_certificate(path).map(Some)
            }
        }
    }

    /// Builds the context once to surface certificate problems at startup.
    pub fn validate(&self) -> SessionResult<()> {
        self.tls_context()?;
        Ok(())
    }
}

/// The single static credential sent with every AUTH.
#[derive(Clone, Deserialize)]
pub struct SharedCredential {
    #[serde(default)]
    username: Option<String>,
    secret: String,
}

impl SharedCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        SharedCredential {
            username: None,
            secret: secret.into(),
        }
    }

    /// Authenticates as an ACL user instead of with the legacy password form.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for SharedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCredential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// One statically configured instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub project: String,
    pub location: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
}

impl InstanceEntry {
    pub fn name(&self) -> InstanceName {
        InstanceName::new(&self.project, &self.location, &self.instance_id)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub credential: SharedCredential,
    #[serde(default)]
    pub security: TransportSecurity,
    #[serde(default)]
    pub pool: PoolTuning,
    #[serde(default)]
    pub instances: Vec<InstanceEntry>,
}

impl SessionConfig {
    /// Reads a JSON file and applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| SessionError::Config(format!("{}: {}", path.display(), err)))?;
        let config = Self::from_json_str(&text)?;
        Ok(config.apply_env_overrides())
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(text: &str) -> SessionResult<Self> {
        let config: SessionConfig =
            serde_json::from_str(text).map_err(|err| SessionError::Config(err.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Replaces the secret with `SKV_SHARED_SECRET` when it is set.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(secret) = std::env::var(SECRET_ENV) {
            if !secret.is_empty() {
                self.credential.secret = secret;
            }
        }
        self
    }

    /// Resolver over the configured instances.
    pub fn resolver(&self) -> StaticInstanceResolver {
        let mut resolver = StaticInstanceResolver::new();
        for entry in &self.instances {
            resolver.insert(entry.name(), &entry.host, entry.port);
        }
        resolver
    }

    fn check(&self) -> SessionResult<()> {
        if self.credential.secret.is_empty() {
            return Err(SessionError::Config("credential.secret must not be empty".to_string()));
        }
        if self.pool.max_total == 0 {
            return Err(SessionError::Config("pool.max_total must be positive".to_string()));
        }
        if self.pool.max_idle > self.pool.max_total || self.pool.min_idle > self.pool.max_idle {
            return Err(SessionError::Config(
                "pool sizes must satisfy min_idle <= max_idle <= max_total".to_string(),
            ));
        }
        if let Some(entry) = self.instances.iter().find(|entry| entry.port == 0) {
            return Err(SessionError::Config(format!("instance {} has port 0", entry.name())));
        }
        Ok(())
    }
}
