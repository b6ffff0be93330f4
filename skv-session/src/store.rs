//! # Session Store
//!
//! Purpose: Map opaque session ids to user ids in the backend, with a fixed
//! time-to-live, using pooled connections from the pool cache.
//!
//! ## Design Principles
//! 1. **Borrow Per Operation**: Each call borrows one connection, runs AUTH
//!    and then its data command on it, and returns it on every exit path.
//! 2. **Absence Is Not an Error**: Missing or expired sessions read as `None`.
//! 3. **Stable Key Layout**: `session:<id>` for the user id and
//!    `session:<id>:<attribute>` for attributes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use skv_client::PooledConnection;
use tracing::debug;
use uuid::Uuid;

use crate::cache::PoolCache;
use crate::config::{SessionConfig, SharedCredential};
use crate::error::{SessionError, SessionResult};
use crate::instance::InstanceDescriptor;

/// Time-to-live applied to every write.
pub const SESSION_TTL: Duration = Duration::from_secs(1800);

const KEY_PREFIX: &str = "session:";

/// Opaque session identifier, a random UUID in canonical hyphenated form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub(crate) fn session_key(session_id: &str) -> String {
    format!("{KEY_PREFIX}{session_id}")
}

pub(crate) fn attribute_key(session_id: &str, attribute: &str) -> String {
    format!("{KEY_PREFIX}{session_id}:{attribute}")
}

/// SCAN pattern matching every attribute key of one session.
pub(crate) fn attribute_pattern(session_id: &str) -> String {
    let mut pattern = String::with_capacity(KEY_PREFIX.len() + session_id.len() + 2);
    pattern.push_str(KEY_PREFIX);
    for ch in session_id.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push_str(":*");
    pattern
}

/// Session operations against any instance the pool cache can reach.
#[derive(Debug, Clone)]
pub struct SessionStore {
    cache: Arc<PoolCache>,
    credential: SharedCredential,
}

impl SessionStore {
    pub fn new(cache: Arc<PoolCache>, credential: SharedCredential) -> Self {
        SessionStore { cache, credential }
    }

    /// Store with its own cache built from `config`.
    pub fn from_config(config: &SessionConfig) -> Self {
        let cache = PoolCache::new(config.pool.clone(), config.security.clone());
        SessionStore::new(Arc::new(cache), config.credential.clone())
    }

    pub fn cache(&self) -> &Arc<PoolCache> {
        &self.cache
    }

    /// Creates a session for `user_id` and returns its new id.
    pub fn create_session(
        &self,
        instance: &InstanceDescriptor,
        user_id: &str,
    ) -> SessionResult<SessionId> {
        let session_id = SessionId::generate();
        let key = session_key(session_id.as_str());
        self.with_connection(instance, |conn| {
            conn.set_with_ttl(key.as_bytes(), user_id.as_bytes(), SESSION_TTL)
        })?;
        debug!(instance = %instance.key(), session = %session_id, "Created session");
        Ok(session_id)
    }

    /// Returns the user id of a live session, `None` when missing or expired.
    pub fn get_user_id_from_session(
        &self,
        instance: &InstanceDescriptor,
        session_id: &str,
    ) -> SessionResult<Option<String>> {
        let key = session_key(session_id);
        let raw = self.with_connection(instance, |conn| conn.get(key.as_bytes()))?;
        raw.map(decode_value).transpose()
    }

    /// Deletes a session; deleting an absent session succeeds.
    pub fn delete_session(&self, instance: &InstanceDescriptor, session_id: &str) -> SessionResult<()> {
        let key = session_key(session_id);
        let removed = self.with_connection(instance, |conn| conn.delete(&[key.as_bytes()]))?;
        debug!(instance = %instance.key(), session = %session_id, removed, "Deleted session");
        Ok(())
    }

    /// Authenticates and pings the instance; returns the reply payload.
    pub fn ping(&self, instance: &InstanceDescriptor) -> SessionResult<String> {
        let reply = self.with_connection(instance, |conn| conn.ping())?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Borrows a connection, authenticates it, and runs `op` on it.
    ///
    /// The connection goes back to the pool when the guard drops, whichever
    /// way this returns.
    pub(crate) fn with_connection<T, F>(&self, instance: &InstanceDescriptor, op: F) -> SessionResult<T>
    where
        F: FnOnce(&mut PooledConnection) -> skv_client::ClientResult<T>,
    {
        let pool = self.cache.get_or_create_pool(instance)?;
        let mut conn = pool.acquire().map_err(SessionError::from_command)?;
        conn.auth(self.credential.username(), self.credential.secret())
            .map_err(SessionError::from_auth)?;
        op(&mut conn).map_err(SessionError::from_command)
    }
}

pub(crate) fn decode_value(raw: Vec<u8>) -> SessionResult<String> {
    String::from_utf8(raw).map_err(|_| SessionError::Backend("stored value is not valid UTF-8".to_string()))
}
