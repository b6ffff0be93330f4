//! Error taxonomy of the session layer.

use std::path::PathBuf;

use skv_client::{ClientError, TlsError};
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by the pool cache and session store.
///
/// None of these are retried internally.
#[derive(Debug, Error)]
pub enum SessionError {
    /// CA certificate missing, unreadable, or not a certificate.
    #[error("failed to load certificate {}: {reason}", .path.display())]
    CertificateLoad { path: PathBuf, reason: String },
    /// Trust store could not be initialized.
    #[error("failed to initialize trust store: {0}")]
    TrustStore(String),
    /// A connection pool for the instance could not be built. Nothing was
    /// cached; the next call tries again.
    #[error("failed to create connection pool for {instance}: {source}")]
    PoolCreation {
        instance: String,
        #[source]
        source: ClientError,
    },
    /// The backend rejected the shared credential.
    #[error("backend rejected the shared credential: {0}")]
    Authentication(String),
    /// No connection could be borrowed or established in time.
    #[error("session store unavailable: {source}")]
    StoreUnavailable {
        #[source]
        source: ClientError,
    },
    /// The instance resolver could not produce a descriptor.
    #[error("failed to resolve instance {name}: {reason}")]
    InstanceResolution { name: String, reason: String },
    /// The backend answered with an error or an unexpected reply.
    #[error("backend error: {0}")]
    Backend(String),
    /// Configuration could not be loaded or is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SessionError {
    /// Classifies a failure of a data command (anything after AUTH).
    pub(crate) fn from_command(err: ClientError) -> Self {
        match err {
            ClientError::Server { message } => {
                SessionError::Backend(String::from_utf8_lossy(&message).into_owned())
            }
            ClientError::Tls(err) => err.into(),
            err if err.is_unavailable() => SessionError::StoreUnavailable { source: err },
            err => SessionError::Backend(err.to_string()),
        }
    }

    /// Classifies a failure of the AUTH command; an error reply means the
    /// credential was rejected.
    pub(crate) fn from_auth(err: ClientError) -> Self {
        match err {
            ClientError::Server { message } => {
                SessionError::Authentication(String::from_utf8_lossy(&message).into_owned())
            }
            err => SessionError::from_command(err),
        }
    }
}

impl From<TlsError> for SessionError {
    fn from(err: TlsError) -> Self {
        match err {
            TlsError::CertificateLoad { path, reason } => {
                SessionError::CertificateLoad { path, reason }
            }
            TlsError::TrustStore(reason) => SessionError::TrustStore(reason),
        }
    }
}
