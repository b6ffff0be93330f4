//! Per-session attributes stored beside the session key.
//!
//! Each attribute lives at `session:<id>:<attribute>` with the session TTL.
//! Bulk removal walks the keyspace with SCAN and deletes batch by batch.

use tracing::debug;

use crate::error::SessionResult;
use crate::instance::InstanceDescriptor;
use crate::store::{attribute_key, attribute_pattern, decode_value, SessionStore, SESSION_TTL};

/// Keys requested per SCAN step.
const SCAN_BATCH: usize = 100;

/// Attribute holding the display name of the session's user.
pub const USERNAME_ATTRIBUTE: &str = "username";

impl SessionStore {
    /// Sets one attribute, refreshing its TTL.
    pub fn set_session_attribute(
        &self,
        instance: &InstanceDescriptor,
        session_id: &str,
        attribute: &str,
        value: &str,
    ) -> SessionResult<()> {
        let key = attribute_key(session_id, attribute);
        self.with_connection(instance, |conn| {
            conn.set_with_ttl(key.as_bytes(), value.as_bytes(), SESSION_TTL)
        })
    }

    /// Reads one attribute, `None` when missing or expired.
    pub fn get_session_attribute(
        &self,
        instance: &InstanceDescriptor,
        session_id: &str,
        attribute: &str,
    ) -> SessionResult<Option<String>> {
        let key = attribute_key(session_id, attribute);
        let raw = self.with_connection(instance, |conn| conn.get(key.as_bytes()))?;
        raw.map(decode_value).transpose()
    }

    /// Deletes every attribute of a session and returns how many were removed.
    ///
    /// The session key itself is left alone.
    pub fn delete_session_attributes(
        &self,
        instance: &InstanceDescriptor,
        session_id: &str,
    ) -> SessionResult<usize> {
        let pattern = attribute_pattern(session_id);
        let removed = self.with_connection(instance, |conn| {
            let mut cursor = 0;
            let mut removed = 0u64;
            loop {
                let page = conn.scan(cursor, pattern.as_bytes(), SCAN_BATCH)?;
                let keys: Vec<&[u8]> = page.keys.iter().map(Vec::as_slice).collect();
                removed += conn.delete(&keys)?;
                cursor = page.cursor;
                if cursor == 0 {
                    return Ok(removed);
                }
            }
        })?;
        debug!(instance = %instance.key(), session = %session_id, removed, "Deleted session attributes");
        Ok(removed as usize)
    }

    /// Username attribute of the session.
    pub fn get_username(
        &self,
        instance: &InstanceDescriptor,
        session_id: &str,
    ) -> SessionResult<Option<String>> {
        self.get_session_attribute(instance, session_id, USERNAME_ATTRIBUTE)
    }
}
