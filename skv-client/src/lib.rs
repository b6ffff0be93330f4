//! # SessionKV Sync Client
//!
//! Purpose: Provide a blocking, Redis-compatible client whose connections are
//! pooled per backend instance and optionally wrapped in TLS.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections (and their TLS sessions) to
//!    avoid repeated handshakes.
//! 2. **RAII Borrowing**: A borrowed connection returns itself on drop, on
//!    every exit path.
//! 3. **Explicit Trust**: TLS contexts are built from a named trust mode; the
//!    permissive mode is spelled `insecure_*` at every call site.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.

mod client;
mod pool;
mod resp;
pub mod tls;

pub use client::{ClientError, ClientResult, ScanPage};
pub use pool::{ConnectionPool, PoolConfig, PoolStatus, PooledConnection};
pub use resp::RespValue;
pub use tls::{TlsContext, TlsError, TrustMode};
