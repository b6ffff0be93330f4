//! # Connection Pool
//!
//! Purpose: Reuse backend connections (plain TCP or TLS) for one instance so
//! each session operation pays neither a TCP nor a TLS handshake.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections;
//!    connects and handshakes happen outside it.
//! 3. **Bounded Waits**: A borrow at capacity waits on a condvar up to the
//!    borrow timeout, then fails instead of blocking forever.
//! 4. **Validate on Borrow**: An idle connection the server closed meanwhile
//!    is evicted with a non-blocking check instead of being handed out.
//! 5. **Cache-Friendly Buffers**: Each connection reuses its own buffers.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustls::{ClientConnection, StreamOwned};
use tracing::{debug, warn};

use crate::client::{ClientError, ClientResult};
use crate::resp::{encode_command, read_response, RespValue};
use crate::tls::TlsContext;

/// Pool configuration for one backend instance.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Backend host name or IP; also the TLS server name.
    pub host: String,
    /// Backend port.
    pub port: u16,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Idle connections `warm_up` opens ahead of demand.
    pub min_idle: usize,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// How long `acquire` waits for a connection when the pool is at capacity.
    pub borrow_timeout: Duration,
    /// Socket read timeout; falls back to `connect_timeout`.
    pub read_timeout: Option<Duration>,
    /// Socket write timeout; falls back to `connect_timeout`.
    pub write_timeout: Option<Duration>,
    /// TLS context; `None` means plaintext.
    pub tls: Option<TlsContext>,
}

impl PoolConfig {
    /// Creates a plaintext configuration with small default limits.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        PoolConfig {
            host: host.into(),
            port,
            max_total: 16,
            max_idle: 8,
            min_idle: 0,
            connect_timeout: Duration::from_secs(2),
            borrow_timeout: Duration::from_secs(2),
            read_timeout: None,
            write_timeout: None,
            tls: None,
        }
    }

    /// Wraps every connection of the pool in the given TLS context.
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Point-in-time counters of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections parked in the idle set.
    pub idle: usize,
    /// Connections currently borrowed.
    pub in_use: usize,
    /// Whether `close` has been called.
    pub closed: bool,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolInner {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn return_connection(&self, conn: Connection) {
        let mut state = self.state.lock();
        let keep = !state.closed && state.idle.len() < self.config.max_idle;
        if keep {
            state.idle.push_back(conn);
            drop(state);
        } else {
            state.total = state.total.saturating_sub(1);
            drop(state);
            conn.shutdown();
        }
        self.available.notify_one();
    }
}

/// Connection pool handle.
///
/// Clones share the same pool; `ptr_eq` tells whether two handles do.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a new connection pool. No connection is opened yet.
    pub fn new(config: PoolConfig) -> ClientResult<Self> {
        if config.host.is_empty() || config.port == 0 {
            return Err(ClientError::InvalidAddress(format!("{}:{}", config.host, config.port)));
        }
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle.min(config.max_total)),
            total: 0,
            closed: false,
        };
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        })
    }

    /// Returns the configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns true when both handles point at the same pool.
    pub fn ptr_eq(a: &ConnectionPool, b: &ConnectionPool) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Borrows a connection, opening a new one when none is idle.
    ///
    /// Idle connections the server has closed in the meantime are dropped
    /// here and the next idle one (or a fresh one) is tried. At capacity this
    /// blocks up to `borrow_timeout` for another borrower to return one, then
    /// fails with `ClientError::PoolTimeout`.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.borrow_timeout;

        loop {
            let mut state = self.inner.state.lock();
            let idle = loop {
                if state.closed {
                    return Err(ClientError::PoolClosed);
                }
                if let Some(conn) = state.idle.pop_front() {
                    break Some(conn);
                }
                if state.total < config.max_total {
                    state.total += 1;
                    break None;
                }
                if self.inner.available.wait_until(&mut state, deadline).timed_out() {
                    warn!(
                        host = %config.host,
                        port = config.port,
                        max_total = config.max_total,
                        "Timed out waiting for a pooled connection"
                    );
                    return Err(ClientError::PoolTimeout(config.borrow_timeout));
                }
            };
            drop(state);

            match idle {
                Some(mut conn) => {
                    if conn.is_alive() {
                        return Ok(PooledConnection::new(self.inner.clone(), conn));
                    }
                    debug!(host = %config.host, port = config.port, "Evicting closed idle connection");
                    self.inner.release_slot();
                }
                None => {
                    return match Connection::connect(config) {
                        Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
                        Err(err) => {
                            self.inner.release_slot();
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    /// Opens connections until `min_idle` are parked. Returns how many were
    /// opened.
    pub fn warm_up(&self) -> ClientResult<usize> {
        let config = &self.inner.config;
        let target = config.min_idle.min(config.max_idle);
        let mut opened = 0;

        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(ClientError::PoolClosed);
                }
                if state.idle.len() >= target || state.total >= config.max_total {
                    return Ok(opened);
                }
                state.total += 1;
            }
            match Connection::connect(config) {
                Ok(conn) => {
                    self.inner.return_connection(conn);
                    opened += 1;
                }
                Err(err) => {
                    self.inner.release_slot();
                    return Err(err);
                }
            }
        }
    }

    /// Closes the pool: idle connections are shut down now, borrowed ones when
    /// they come back. Idempotent.
    pub fn close(&self) {
        let drained: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        self.inner.available.notify_all();

        debug!(
            host = %self.inner.config.host,
            port = self.inner.config.port,
            closed_idle = drained.len(),
            "Closed connection pool"
        );
        for conn in drained {
            conn.shutdown();
        }
    }

    /// Returns the current idle/in-use counters.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            in_use: state.total.saturating_sub(state.idle.len()),
            closed: state.closed,
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("tls", &self.inner.config.tls.as_ref().map(TlsContext::mode))
            .finish()
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Executes a RESP command and returns the parsed reply.
    pub fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let conn = match self.conn.as_mut() {
            Some(conn) if self.valid => conn,
            _ => return Err(ClientError::Protocol),
        };
        let response = conn.exec(args);
        if response.is_err() {
            // If IO/protocol fails, do not return this connection to the pool.
            self.valid = false;
        }
        response
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if self.valid {
            self.pool.return_connection(conn);
        } else {
            debug!(host = %self.pool.config.host, "Discarding broken connection");
            self.pool.release_slot();
        }
    }
}

/// Byte stream under a connection.
enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Tls(stream) => stream.flush(),
        }
    }
}

/// Single backend connection with reusable buffers.
struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<Transport>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl Connection {
    fn connect(config: &PoolConfig) -> ClientResult<Self> {
        let stream = connect_stream(config)?;
        stream.set_read_timeout(Some(config.read_timeout.unwrap_or(config.connect_timeout)))?;
        stream.set_write_timeout(Some(config.write_timeout.unwrap_or(config.connect_timeout)))?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let transport = match &config.tls {
            Some(tls) => Transport::Tls(Box::new(tls.connect(&config.host, stream)?)),
            None => Transport::Plain(stream),
        };
        debug!(
            host = %config.host,
            port = config.port,
            tls = config.tls.is_some(),
            "Opened backend connection"
        );

        Ok(Connection {
            reader: BufReader::new(transport),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        })
    }

    fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        read_response(&mut self.reader, &mut self.line_buf)
    }

    /// Checks without blocking whether the server has closed the connection
    /// while it sat idle.
    ///
    /// Plain connections must have nothing pending: RESP2 servers never send
    /// unsolicited data. TLS connections may carry session tickets, so
    /// pending records are processed and only a close counts.
    fn is_alive(&mut self) -> bool {
        if !self.reader.buffer().is_empty() {
            return false;
        }
        match self.reader.get_mut() {
            Transport::Plain(stream) => {
                if stream.set_nonblocking(true).is_err() {
                    return false;
                }
                let mut byte = [0u8; 1];
                let alive = matches!(
                    stream.peek(&mut byte),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock
                );
                alive && stream.set_nonblocking(false).is_ok()
            }
            Transport::Tls(stream) => {
                if stream.sock.set_nonblocking(true).is_err() {
                    return false;
                }
                let alive = tls_is_open(stream);
                alive && stream.sock.set_nonblocking(false).is_ok()
            }
        }
    }

    fn shutdown(mut self) {
        if let Transport::Tls(stream) = self.reader.get_mut() {
            stream.conn.send_close_notify();
            let _ = stream.flush();
        }
    }
}

/// Drains whatever TLS records arrived while idle; false on EOF, error, or a
/// peer close_notify.
fn tls_is_open(stream: &mut StreamOwned<ClientConnection, TcpStream>) -> bool {
    loop {
        match stream.conn.read_tls(&mut stream.sock) {
            Ok(0) => return false,
            Ok(_) => match stream.conn.process_new_packets() {
                Ok(io_state) if io_state.peer_has_closed() => return false,
                Ok(io_state) if io_state.plaintext_bytes_to_read() > 0 => return false,
                Ok(_) => {}
                Err(_) => return false,
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
            Err(_) => return false,
        }
    }
}

fn connect_stream(config: &PoolConfig) -> ClientResult<TcpStream> {
    let target = format!("{}:{}", config.host, config.port);
    let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|_| ClientError::InvalidAddress(target.clone()))?
        .collect();

    // One budget for all resolved addresses.
    let deadline = Instant::now() + config.connect_timeout;
    match connect_any(&addrs, deadline) {
        Some(result) => result.map_err(ClientError::Io),
        None => Err(ClientError::InvalidAddress(target)),
    }
}

/// Tries each address in turn until one connects or `deadline` passes.
/// `None` when there was no address to try.
fn connect_any(addrs: &[SocketAddr], deadline: Instant) -> Option<io::Result<TcpStream>> {
    let mut last_err = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            last_err = Some(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            break;
        }
        match TcpStream::connect_timeout(addr, remaining) {
            Ok(stream) => return Some(Ok(stream)),
            Err(err) => last_err = Some(err),
        }
    }
    last_err.map(Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr")
    }

    #[test]
    fn expired_deadline_skips_remaining_addresses() {
        let addrs = [refused_addr(), refused_addr()];
        let result = connect_any(&addrs, Instant::now()).expect("attempted");
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn later_address_connects_within_shared_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let live = listener.local_addr().expect("addr");
        let addrs = [refused_addr(), live];

        let deadline = Instant::now() + Duration::from_secs(2);
        let stream = connect_any(&addrs, deadline).expect("attempted").expect("connected");
        assert_eq!(stream.peer_addr().expect("peer"), live);
    }

    #[test]
    fn no_addresses_means_nothing_attempted() {
        assert!(connect_any(&[], Instant::now() + Duration::from_secs(1)).is_none());
    }
}
