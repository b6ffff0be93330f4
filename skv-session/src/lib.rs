//! # SessionKV Session Layer
//!
//! Purpose: Keep one pooled, TLS-secured connection pool per backend instance
//! and store time-limited session records through it.
//!
//! ## Structure Overview
//!
//! ```text
//! SessionStore ── credential (AUTH on every borrow)
//!   └── PoolCache: DashMap<instance key, ConnectionPool>
//!         └── PoolFactory (TlsPoolFactory: PoolTuning + TransportSecurity)
//!               └── skv_client::ConnectionPool ── TlsContext
//! ```
//!
//! ## Design Principles
//! 1. **Compute If Absent**: Pools are created under the map entry lock, so
//!    concurrent first access builds exactly one pool per instance.
//! 2. **RAII Borrowing**: Connections go back to their pool on every exit path.
//! 3. **Not Found Is Data**: Missing or expired sessions are `Ok(None)`.

pub mod attributes;
pub mod cache;
pub mod config;
pub mod error;
pub mod instance;
pub mod store;

pub use cache::{PoolCache, PoolFactory, PoolTuning, TlsPoolFactory};
pub use config::{SessionConfig, SharedCredential, TransportSecurity};
pub use error::{SessionError, SessionResult};
pub use instance::{InstanceDescriptor, InstanceName, InstanceResolver, StaticInstanceResolver};
pub use store::{SessionId, SessionStore, SESSION_TTL};

pub use skv_client::{ConnectionPool, PoolStatus, TlsContext, TrustMode};
