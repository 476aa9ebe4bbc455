// tests/common/mod.rs

//! Shared test fixture: an in-process memcached speaking the binary protocol.
//!
//! The mock keeps its store in memory, records every request it parses (for
//! ordering assertions), and can be switched into a drop mode where it closes
//! the connection after reading a request instead of answering, which is the
//! lever for exercising mid-flight link loss.

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const HEADER_SIZE: usize = 24;
const REQUEST_MAGIC: u8 = 0x80;
const RESPONSE_MAGIC: u8 = 0x81;

pub const OP_GET: u8 = 0x00;
pub const OP_SET: u8 = 0x01;
pub const OP_ADD: u8 = 0x02;
pub const OP_REPLACE: u8 = 0x03;
pub const OP_DELETE: u8 = 0x04;
pub const OP_INCREMENT: u8 = 0x05;
pub const OP_DECREMENT: u8 = 0x06;
pub const OP_APPEND: u8 = 0x0E;
pub const OP_PREPEND: u8 = 0x0F;
pub const OP_SETQ: u8 = 0x11;
pub const OP_DELETEQ: u8 = 0x14;
pub const OP_INCREMENTQ: u8 = 0x15;
pub const OP_TOUCH: u8 = 0x1C;

const STATUS_OK: u16 = 0x0000;
const STATUS_KEY_NOT_FOUND: u16 = 0x0001;
const STATUS_KEY_EXISTS: u16 = 0x0002;
const STATUS_ITEM_NOT_STORED: u16 = 0x0005;
const STATUS_NON_NUMERIC: u16 = 0x0006;

/// Counter expiry sentinel: do not auto-create.
const NO_AUTO_CREATE: u32 = 0xffff_ffff;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

#[derive(Default)]
struct State {
    store: Mutex<HashMap<Vec<u8>, Entry>>,
    log: Mutex<Vec<(u8, Vec<u8>)>>,
    cas_counter: AtomicU64,
    drop_requests: AtomicBool,
    accepted: AtomicUsize,
}

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<State>,
    accept_task: JoinHandle<()>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        Self::from_listener(listener)
    }

    /// Binds an exact address (with `SO_REUSEADDR`, so a freshly stopped
    /// mock's port can be reclaimed).
    pub async fn start_on(addr: SocketAddr) -> MockServer {
        let socket = TcpSocket::new_v4().expect("socket");
        socket.set_reuseaddr(true).expect("reuseaddr");
        socket.bind(addr).expect("bind mock addr");
        let listener = socket.listen(64).expect("listen");
        Self::from_listener(listener)
    }

    fn from_listener(listener: TcpListener) -> MockServer {
        // Surface client-side tracing when a test run sets RUST_LOG.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(State::default());
        let conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_state = state.clone();
        let accept_conns = conn_tasks.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let conn_state = accept_state.clone();
                accept_conns
                    .lock()
                    .push(tokio::spawn(handle_conn(stream, conn_state)));
            }
        });

        MockServer {
            addr,
            state,
            accept_task,
            conn_tasks,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host_spec(&self) -> String {
        format!("{}:{}", self.addr.ip(), self.addr.port())
    }

    /// Stops accepting and severs every open connection.
    pub fn stop(&self) {
        self.accept_task.abort();
        for task in self.conn_tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// When enabled, every request is read and then the connection is closed
    /// without a response.
    pub fn set_drop_requests(&self, on: bool) {
        self.state.drop_requests.store(on, Ordering::SeqCst);
    }

    pub fn accepted_connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.state.store.lock().contains_key(key)
    }

    pub fn stored_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.store.lock().get(key).map(|e| e.value.clone())
    }

    /// Requests seen so far, as `(opcode, key)` pairs in arrival order.
    pub fn request_log(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.log.lock().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_conn(mut stream: TcpStream, state: Arc<State>) {
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        if header[0] != REQUEST_MAGIC {
            return;
        }
        let opcode = header[1];
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extras_len = header[4] as usize;
        let total_body = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
        let request_cas = u64::from_be_bytes([
            header[16], header[17], header[18], header[19], header[20], header[21], header[22],
            header[23],
        ]);

        let mut body = vec![0u8; total_body];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let (extras, rest) = body.split_at(extras_len);
        let (key, value) = rest.split_at(key_len);

        state.log.lock().push((opcode, key.to_vec()));

        if state.drop_requests.load(Ordering::SeqCst) {
            return;
        }

        let reply = execute(&state, opcode, extras, key, value, request_cas);
        let quiet = matches!(opcode, 0x11..=0x17 | 0x19 | 0x1A);
        if quiet && reply.status == STATUS_OK {
            continue;
        }
        let frame = encode_reply(opcode, opaque, &reply);
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

struct Reply {
    status: u16,
    flags: Option<u32>,
    value: Vec<u8>,
    cas: u64,
}

impl Reply {
    fn status(status: u16) -> Reply {
        Reply {
            status,
            flags: None,
            value: Vec::new(),
            cas: 0,
        }
    }
}

fn execute(
    state: &State,
    opcode: u8,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    request_cas: u64,
) -> Reply {
    let mut store = state.store.lock();
    let next_cas = || state.cas_counter.fetch_add(1, Ordering::SeqCst) + 1;

    match opcode {
        OP_GET => match store.get(key) {
            Some(entry) => Reply {
                status: STATUS_OK,
                flags: Some(entry.flags),
                value: entry.value.clone(),
                cas: entry.cas,
            },
            None => Reply::status(STATUS_KEY_NOT_FOUND),
        },
        OP_SET | OP_SETQ => {
            let flags = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
            if request_cas != 0 {
                match store.get(key) {
                    None => return Reply::status(STATUS_KEY_NOT_FOUND),
                    Some(entry) if entry.cas != request_cas => {
                        return Reply::status(STATUS_KEY_EXISTS);
                    }
                    Some(_) => {}
                }
            }
            let cas = next_cas();
            store.insert(
                key.to_vec(),
                Entry {
                    value: value.to_vec(),
                    flags,
                    cas,
                },
            );
            Reply {
                status: STATUS_OK,
                flags: None,
                value: Vec::new(),
                cas,
            }
        }
        OP_ADD | 0x12 => {
            if store.contains_key(key) {
                return Reply::status(STATUS_KEY_EXISTS);
            }
            let flags = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
            let cas = next_cas();
            store.insert(
                key.to_vec(),
                Entry {
                    value: value.to_vec(),
                    flags,
                    cas,
                },
            );
            Reply {
                status: STATUS_OK,
                flags: None,
                value: Vec::new(),
                cas,
            }
        }
        OP_REPLACE | 0x13 => {
            if !store.contains_key(key) {
                return Reply::status(STATUS_KEY_NOT_FOUND);
            }
            let flags = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
            let cas = next_cas();
            store.insert(
                key.to_vec(),
                Entry {
                    value: value.to_vec(),
                    flags,
                    cas,
                },
            );
            Reply {
                status: STATUS_OK,
                flags: None,
                value: Vec::new(),
                cas,
            }
        }
        OP_DELETE | OP_DELETEQ => {
            if store.remove(key).is_none() {
                return Reply::status(STATUS_KEY_NOT_FOUND);
            }
            Reply::status(STATUS_OK)
        }
        OP_INCREMENT | OP_DECREMENT | OP_INCREMENTQ | 0x16 => {
            let delta = u64::from_be_bytes(extras[0..8].try_into().unwrap());
            let initial = u64::from_be_bytes(extras[8..16].try_into().unwrap());
            let expiry = u32::from_be_bytes(extras[16..20].try_into().unwrap());
            let increment = matches!(opcode, OP_INCREMENT | OP_INCREMENTQ);

            let current = match store.get(key) {
                Some(entry) => {
                    let text = match std::str::from_utf8(&entry.value) {
                        Ok(text) => text,
                        Err(_) => return Reply::status(STATUS_NON_NUMERIC),
                    };
                    let Ok(current) = text.trim().parse::<u64>() else {
                        return Reply::status(STATUS_NON_NUMERIC);
                    };
                    Some(current)
                }
                None => None,
            };

            let new_value = match current {
                Some(current) => {
                    if increment {
                        current.wrapping_add(delta)
                    } else {
                        current.saturating_sub(delta)
                    }
                }
                None => {
                    if expiry == NO_AUTO_CREATE {
                        return Reply::status(STATUS_KEY_NOT_FOUND);
                    }
                    initial
                }
            };

            let cas = next_cas();
            store.insert(
                key.to_vec(),
                Entry {
                    value: new_value.to_string().into_bytes(),
                    flags: 0,
                    cas,
                },
            );
            Reply {
                status: STATUS_OK,
                flags: None,
                value: new_value.to_be_bytes().to_vec(),
                cas,
            }
        }
        OP_APPEND | OP_PREPEND | 0x19 | 0x1A => {
            let Some(entry) = store.get_mut(key) else {
                return Reply::status(STATUS_ITEM_NOT_STORED);
            };
            if matches!(opcode, OP_APPEND | 0x19) {
                entry.value.extend_from_slice(value);
            } else {
                let mut combined = value.to_vec();
                combined.extend_from_slice(&entry.value);
                entry.value = combined;
            }
            entry.cas = next_cas();
            Reply {
                status: STATUS_OK,
                flags: None,
                value: Vec::new(),
                cas: entry.cas,
            }
        }
        OP_TOUCH => match store.get(key) {
            Some(entry) => Reply {
                status: STATUS_OK,
                flags: None,
                value: Vec::new(),
                cas: entry.cas,
            },
            None => Reply::status(STATUS_KEY_NOT_FOUND),
        },
        _ => Reply::status(0x0081), // unknown command
    }
}

fn encode_reply(opcode: u8, opaque: u32, reply: &Reply) -> BytesMut {
    let extras_len = if reply.flags.is_some() { 4 } else { 0 };
    let total_body = extras_len + reply.value.len();

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + total_body);
    buf.put_u8(RESPONSE_MAGIC);
    buf.put_u8(opcode);
    buf.put_u16(0); // key length
    buf.put_u8(extras_len as u8);
    buf.put_u8(0); // data type
    buf.put_u16(reply.status);
    buf.put_u32(total_body as u32);
    buf.put_u32(opaque);
    buf.put_u64(reply.cas);
    if let Some(flags) = reply.flags {
        buf.put_u32(flags);
    }
    buf.extend_from_slice(&reply.value);
    buf
}

/// Polls a condition until it holds or a 5s deadline passes.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

/// Reserves a local port by binding and immediately dropping a listener.
pub async fn reserve_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("reserve");
    listener.local_addr().expect("local addr")
}
