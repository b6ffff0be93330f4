//! # Typed Commands
//!
//! Purpose: Expose the handful of commands the session layer needs as typed
//! methods on a borrowed connection, so several commands (AUTH, then the data
//! operation) run on the same connection within one borrow.
//!
//! ## Design Principles
//! 1. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 2. **Fail Fast**: Protocol violations surface immediately as errors.
//! 3. **Server Errors Are Data**: An error reply keeps the connection usable;
//!    only I/O and framing failures discard it.

use std::time::Duration;

use thiserror::Error;

use crate::pool::PooledConnection;
use crate::resp::RespValue;
use crate::tls::TlsError;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Reply type did not match the expected command reply.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// No connection became available before the borrow timeout.
    #[error("no pooled connection available within {0:?}")]
    PoolTimeout(Duration),
    /// The pool was closed and hands out no more connections.
    #[error("connection pool is closed")]
    PoolClosed,
    /// Host/port could not be resolved into a socket address or server name.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// TLS handshake with the server failed.
    #[error("tls handshake failed: {0}")]
    Handshake(String),
    /// TLS context could not be built.
    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl ClientError {
    /// Returns true for failures that mean the backend could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::PoolTimeout(_)
                | ClientError::PoolClosed
                | ClientError::InvalidAddress(_)
                | ClientError::Handshake(_)
        )
    }
}

/// One page of a SCAN iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call; 0 once the iteration is complete.
    pub cursor: u64,
    /// Keys returned by this page.
    pub keys: Vec<Vec<u8>>,
}

impl PooledConnection {
    /// Authenticates the connection.
    ///
    /// With a username the two-argument ACL form is sent, otherwise the legacy
    /// single-password form. A rejected credential is `ClientError::Server`.
    pub fn auth(&mut self, username: Option<&str>, secret: &str) -> ClientResult<()> {
        let reply = match username {
            Some(user) => self.exec(&[b"AUTH", user.as_bytes(), secret.as_bytes()])?,
            None => self.exec(&[b"AUTH", secret.as_bytes()])?,
        };
        expect_ok(reply)
    }

    /// Pings the server and returns the reply payload.
    pub fn ping(&mut self) -> ClientResult<Vec<u8>> {
        match self.exec(&[b"PING"])? {
            RespValue::Error(message) => Err(ClientError::Server { message }),
            other => other.into_bytes().ok_or(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches a value by key. Returns `Ok(None)` when the key is missing.
    pub fn get(&mut self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        match self.exec(&[b"GET", key])? {
            RespValue::Bulk(data) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value and attaches an expiration in whole seconds.
    pub fn set_with_ttl(&mut self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()> {
        let seconds = ttl.as_secs().max(1).to_string();
        let reply = self.exec(&[b"SET", key, value, b"EX", seconds.as_bytes()])?;
        expect_ok(reply)
    }

    /// Deletes keys. Returns the number of keys removed.
    pub fn delete(&mut self, keys: &[&[u8]]) -> ClientResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        args.push(b"DEL");
        args.extend_from_slice(keys);

        match self.exec(&args)? {
            RespValue::Integer(count) => Ok(count.max(0) as u64),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Runs one `SCAN cursor MATCH pattern COUNT count` step.
    pub fn scan(&mut self, cursor: u64, pattern: &[u8], count: usize) -> ClientResult<ScanPage> {
        let cursor_arg = cursor.to_string();
        let count_arg = count.to_string();
        let reply = self.exec(&[
            b"SCAN",
            cursor_arg.as_bytes(),
            b"MATCH",
            pattern,
            b"COUNT",
            count_arg.as_bytes(),
        ])?;

        let mut parts = match reply {
            RespValue::Array(Some(parts)) if parts.len() == 2 => parts,
            RespValue::Error(message) => return Err(ClientError::Server { message }),
            _ => return Err(ClientError::UnexpectedResponse),
        };
        let keys = match parts.pop() {
            Some(RespValue::Array(Some(items))) => items
                .into_iter()
                .map(|item| item.into_bytes().ok_or(ClientError::UnexpectedResponse))
                .collect::<ClientResult<Vec<_>>>()?,
            Some(RespValue::Array(None)) => Vec::new(),
            _ => return Err(ClientError::UnexpectedResponse),
        };
        let cursor = parts
            .pop()
            .and_then(RespValue::into_bytes)
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or(ClientError::UnexpectedResponse)?;

        Ok(ScanPage { cursor, keys })
    }
}

fn expect_ok(reply: RespValue) -> ClientResult<()> {
    match reply {
        RespValue::Simple(_) => Ok(()),
        RespValue::Error(message) => Err(ClientError::Server { message }),
        _ => Err(ClientError::UnexpectedResponse),
    }
}
