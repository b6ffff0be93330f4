#![allow(dead_code)]

//! In-process fake backend speaking enough RESP2 for the session store:
//! AUTH, SET .. EX, GET, DEL, SCAN .. MATCH .. COUNT, PING.
//!
//! Expiry runs on a virtual clock that tests move with `advance`.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use skv_session::{
    InstanceDescriptor, PoolCache, PoolTuning, SessionStore, SharedCredential, TransportSecurity,
};

pub const SECRET: &str = "shared-secret";

struct Entry {
    value: Vec<u8>,
    expires_at: Option<u64>,
}

#[derive(Default)]
struct State {
    data: BTreeMap<Vec<u8>, Entry>,
    now: u64,
    commands: Vec<Vec<Vec<u8>>>,
    scans: HashMap<u64, Vec<u8>>,
    next_scan: u64,
}

impl State {
    fn purge_expired(&mut self) {
        let now = self.now;
        self.data
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
    }
}

pub struct FakeBackend {
    port: u16,
    state: Arc<Mutex<State>>,
}

impl FakeBackend {
    /// Backend accepting the legacy single-password AUTH with `SECRET`.
    pub fn start() -> Self {
        Self::start_with_user(None)
    }

    /// Backend that additionally requires `username` in AUTH.
    pub fn start_with_user(username: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let state = Arc::new(Mutex::new(State {
            next_scan: 1,
            ..State::default()
        }));
        let username = username.map(str::to_string);

        let shared = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = shared.clone();
                let username = username.clone();
                thread::spawn(move || serve(stream, state, username));
            }
        });

        FakeBackend { port, state }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn descriptor(&self) -> InstanceDescriptor {
        InstanceDescriptor::new(
            format!("projects/test/locations/local/instances/{}", self.port),
            "127.0.0.1",
            self.port,
        )
    }

    /// Moves the virtual clock forward.
    pub fn advance(&self, seconds: u64) {
        self.state.lock().expect("state").now += seconds;
    }

    pub fn contains(&self, key: &str) -> bool {
        let mut state = self.state.lock().expect("state");
        state.purge_expired();
        state.data.contains_key(key.as_bytes())
    }

    /// Remaining TTL in seconds of a live key.
    pub fn ttl_of(&self, key: &str) -> Option<u64> {
        let mut state = self.state.lock().expect("state");
        state.purge_expired();
        let now = state.now;
        state
            .data
            .get(key.as_bytes())
            .and_then(|entry| entry.expires_at)
            .map(|at| at - now)
    }

    pub fn set_raw(&self, key: &str, value: &[u8]) {
        self.state.lock().expect("state").data.insert(
            key.as_bytes().to_vec(),
            Entry {
                value: value.to_vec(),
                expires_at: None,
            },
        );
    }

    pub fn len(&self) -> usize {
        let mut state = self.state.lock().expect("state");
        state.purge_expired();
        state.data.len()
    }

    /// Every command received so far, lossily decoded.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .expect("state")
            .commands
            .iter()
            .map(|args| {
                args.iter()
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect()
            })
            .collect()
    }

    pub fn command_count(&self, name: &str) -> usize {
        self.commands().iter().filter(|args| args[0] == name).count()
    }
}

/// Store over a fresh plaintext cache with small, fast-failing pools.
pub fn store() -> SessionStore {
    store_with(small_tuning(), SharedCredential::new(SECRET))
}

pub fn store_with(tuning: PoolTuning, credential: SharedCredential) -> SessionStore {
    let cache = PoolCache::new(tuning, TransportSecurity::Plaintext);
    SessionStore::new(Arc::new(cache), credential)
}

pub fn small_tuning() -> PoolTuning {
    PoolTuning {
        max_total: 4,
        max_idle: 4,
        min_idle: 1,
        connect_timeout_ms: 200,
        prefill_min_idle: false,
    }
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

fn serve(mut stream: TcpStream, state: Arc<Mutex<State>>, username: Option<String>) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
    let mut authenticated = false;
    while let Ok(Some(args)) = read_command(&mut reader) {
        if args.is_empty() {
            return;
        }
        let reply = {
            let mut state = state.lock().expect("state");
            state.commands.push(args.clone());
            handle(&mut state, &args, &mut authenticated, username.as_deref())
        };
        if stream.write_all(&reply).is_err() {
            return;
        }
    }
}

fn handle(state: &mut State, args: &[Vec<u8>], authenticated: &mut bool, username: Option<&str>) -> Vec<u8> {
    let name = args[0].to_ascii_uppercase();
    if name == b"AUTH" {
        let (user, secret) = match args.len() {
            2 => (None, &args[1]),
            3 => (Some(args[1].as_slice()), &args[2]),
            _ => return error("ERR wrong number of arguments for 'auth' command"),
        };
        let user_ok = match (username, user) {
            (Some(expected), Some(given)) => expected.as_bytes() == given,
            (Some(_), None) => false,
            (None, given) => given.map_or(true, |given| given == b"default"),
        };
        if user_ok && secret.as_slice() == SECRET.as_bytes() {
            *authenticated = true;
            return simple("OK");
        }
        return error("WRONGPASS invalid username-password pair or user is disabled.");
    }
    if !*authenticated {
        return error("NOAUTH Authentication required.");
    }

    state.purge_expired();
    match name.as_slice() {
        b"PING" => simple("PONG"),
        b"SET" if args.len() == 5 && args[3].eq_ignore_ascii_case(b"EX") => {
            let Some(seconds) = parse_u64(&args[4]).filter(|s| *s > 0) else {
                return error("ERR invalid expire time in 'set' command");
            };
            let expires_at = Some(state.now + seconds);
            state.data.insert(
                args[1].clone(),
                Entry {
                    value: args[2].clone(),
                    expires_at,
                },
            );
            simple("OK")
        }
        b"GET" if args.len() == 2 => match state.data.get(&args[1]) {
            Some(entry) => bulk(&entry.value),
            None => b"$-1\r\n".to_vec(),
        },
        b"DEL" if args.len() >= 2 => {
            let removed = args[1..]
                .iter()
                .filter(|key| state.data.remove(*key).is_some())
                .count();
            format!(":{removed}\r\n").into_bytes()
        }
        b"SCAN" if args.len() == 6 => scan(state, args),
        _ => error("ERR unknown command"),
    }
}

/// Cursors name the last key examined, so deletes between pages never make
/// the iteration skip keys.
fn scan(state: &mut State, args: &[Vec<u8>]) -> Vec<u8> {
    let (Some(cursor), Some(count)) = (parse_u64(&args[1]), parse_u64(&args[5])) else {
        return error("ERR invalid cursor");
    };
    let pattern = &args[3];
    let resume_after = match cursor {
        0 => None,
        id => match state.scans.remove(&id) {
            Some(key) => Some(key),
            None => return error("ERR invalid cursor"),
        },
    };

    let examined: Vec<Vec<u8>> = state
        .data
        .keys()
        .filter(|key| resume_after.as_ref().map_or(true, |after| *key > after))
        .take(count as usize)
        .cloned()
        .collect();
    let finished = examined.len() < count as usize
        || examined.last().map_or(true, |last| {
            state.data.keys().next_back().map_or(true, |max| last == max)
        });

    let next = match examined.last() {
        Some(last) if !finished => {
            let id = state.next_scan;
            state.next_scan += 1;
            state.scans.insert(id, last.clone());
            id
        }
        _ => 0,
    };

    let matched: Vec<&Vec<u8>> = examined
        .iter()
        .filter(|key| glob_match(pattern, key))
        .collect();
    let mut reply = b"*2\r\n".to_vec();
    reply.extend(bulk(next.to_string().as_bytes()));
    reply.extend(format!("*{}\r\n", matched.len()).into_bytes());
    for key in matched {
        reply.extend(bulk(key));
    }
    reply
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|skip| glob_match(rest, &text[skip..])),
        Some((b'?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((b'\\', rest)) if !rest.is_empty() => {
            text.first() == Some(&rest[0]) && glob_match(&rest[1..], &text[1..])
        }
        Some((ch, rest)) => text.first() == Some(ch) && glob_match(rest, &text[1..]),
    }
}

fn simple(text: &str) -> Vec<u8> {
    format!("+{text}\r\n").into_bytes()
}

fn error(text: &str) -> Vec<u8> {
    format!("-{text}\r\n").into_bytes()
}

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn parse_u64(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn read_command<R: BufRead>(reader: &mut R) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Ok(None);
    }
    let count = parse_header(&line, b'*')?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_until(b'\n', &mut line)?;
        let len = parse_header(&line, b'$')?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data)?;
        data.truncate(len);
        args.push(data);
    }
    Ok(Some(args))
}

fn parse_header(line: &[u8], marker: u8) -> std::io::Result<usize> {
    let invalid = || std::io::Error::new(std::io::ErrorKind::InvalidData, "bad header");
    if line.first() != Some(&marker) || !line.ends_with(b"\r\n") {
        return Err(invalid());
    }
    std::str::from_utf8(&line[1..line.len() - 2])
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(invalid)
}

#[test]
fn glob_matcher_honours_escapes() {
    assert!(glob_match(b"session:a:*", b"session:a:x"));
    assert!(!glob_match(b"session:a:*", b"session:ab:x"));
    assert!(glob_match(b"session:a\\*:*", b"session:a*:x"));
    assert!(!glob_match(b"session:a\\*:*", b"session:ab:x"));
    assert!(glob_match(b"k?y", b"key"));
}
