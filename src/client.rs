// src/client.rs

//! Cluster-facing client: consistent-hash routing, value typing, command
//! shaping, and membership repair.
//!
//! The client owns the hash ring and the map of live [`Server`]s, both behind
//! a single lock written only by the membership task. Each command hashes its
//! key to a ring member, resolves the server, and is dispatched without
//! blocking; completion arrives through the per-request reply channel. When a
//! server is declared dead, its ring position is either inherited by the next
//! replacement host or redistributed across the remaining members.

use crate::config::ClientConfig;
use crate::errors::CitrineError;
use crate::host::{Host, parse_hosts};
use crate::protocol::{Command, Opcode, Response, Status};
use crate::ring::HashRing;
use crate::server::Server;
use crate::value::CacheValue;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Longest key the protocol accepts; longer keys are digested when long-key
/// hashing is enabled.
const MAX_KEY_LEN: usize = 250;
/// Marker prefixing digested long keys, distinguishing them from user keys.
const HASHED_KEY_MARKER: &str = "#h#";
/// Counter expiry sentinel: the server must not auto-create the key.
pub const NO_AUTO_CREATE: u32 = 0xffff_ffff;

/// Outcome of a read operation. A missing key is not an error: `value` is
/// `None` and `status` reports `KEY_NOT_FOUND`.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub value: Option<CacheValue>,
    pub cas: u64,
    pub status: Status,
}

/// Raw outcome of a read, bypassing flag-tag decoding.
#[derive(Debug, Clone)]
pub struct RawLookup {
    pub value: Option<Bytes>,
    pub flags: u32,
    pub cas: u64,
    pub status: Status,
}

/// Outcome of a mutating operation.
#[derive(Debug, Clone, Copy)]
pub struct Receipt {
    pub cas: u64,
    pub status: Status,
}

/// Outcome of a counter operation.
#[derive(Debug, Clone, Copy)]
pub struct Counter {
    pub value: u64,
    pub cas: u64,
    pub status: Status,
}

/// Ring membership and the live server map, mutated only by the membership
/// task.
struct Topology {
    ring: HashRing,
    servers: HashMap<String, Server>,
}

struct ClientInner {
    config: ClientConfig,
    topology: RwLock<Topology>,
    replacements: Mutex<VecDeque<Host>>,
    /// Taken on shutdown so the membership task can drain and exit.
    dead_tx: Mutex<Option<mpsc::UnboundedSender<Host>>>,
    ended: AtomicBool,
}

/// Asynchronous memcached client over a cluster of hosts; cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Builds one server per host, registers the weighted ring members, and
    /// spawns the membership task. Must run inside a tokio runtime.
    pub fn new<S: AsRef<str>>(hosts: &[S], config: ClientConfig) -> Result<Client, CitrineError> {
        let hosts = parse_hosts(hosts)?;
        if hosts.is_empty() {
            return Err(CitrineError::InvalidHost("empty host list".to_string()));
        }
        let replacements = parse_hosts(&config.replacement_hosts)?;

        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let mut topology = Topology {
            ring: HashRing::new(),
            servers: HashMap::new(),
        };
        for host in hosts {
            topology.ring.add(host.id(), host.weight);
            let server = Server::spawn(host.clone(), &config, dead_tx.clone());
            topology.servers.insert(host.id().to_string(), server);
        }

        let inner = Arc::new(ClientInner {
            config,
            topology: RwLock::new(topology),
            replacements: Mutex::new(replacements.into()),
            dead_tx: Mutex::new(Some(dead_tx)),
            ended: AtomicBool::new(false),
        });
        tokio::spawn(membership(inner.clone(), dead_rx));
        Ok(Client { inner })
    }

    /// Number of live servers.
    pub fn server_count(&self) -> usize {
        self.inner.topology.read().servers.len()
    }

    /// Identifiers of the live servers, in no particular order.
    pub fn server_ids(&self) -> Vec<String> {
        self.inner.topology.read().servers.keys().cloned().collect()
    }

    /// Resolves the server a key currently routes to.
    pub fn server_for(&self, key: &str) -> Option<String> {
        let wire_key = self.wire_key(key);
        let topology = self.inner.topology.read();
        topology
            .ring
            .get_cached(&wire_key)
            .map(|member| member.to_string())
    }

    // -- Read operations -----------------------------------------------------

    /// Fetches and decodes a value. A missing key yields `value: None` with
    /// `KEY_NOT_FOUND` status rather than an error.
    pub async fn get(&self, key: &str) -> Result<Lookup, CitrineError> {
        let response = self
            .send_command(Command::new(Opcode::Get, self.wire_key(key)))
            .await?;
        if response.status == Status::KeyNotFound {
            return Ok(Lookup {
                value: None,
                cas: 0,
                status: response.status,
            });
        }
        check_status(&response, key)?;
        let value = match response.value {
            Some(data) => Some(CacheValue::decode(response.flags, data)?),
            None => None,
        };
        Ok(Lookup {
            value,
            cas: response.cas,
            status: response.status,
        })
    }

    /// Fetches the raw byte payload and flag tag without decoding.
    pub async fn get_raw(&self, key: &str) -> Result<RawLookup, CitrineError> {
        let response = self
            .send_command(Command::new(Opcode::Get, self.wire_key(key)))
            .await?;
        if response.status == Status::KeyNotFound {
            return Ok(RawLookup {
                value: None,
                flags: 0,
                cas: 0,
                status: response.status,
            });
        }
        check_status(&response, key)?;
        Ok(RawLookup {
            value: response.value,
            flags: response.flags,
            cas: response.cas,
            status: response.status,
        })
    }

    // -- Store operations ----------------------------------------------------

    pub async fn set(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: u32,
    ) -> Result<Receipt, CitrineError> {
        self.store(Opcode::Set, key, value.into(), ttl, 0).await
    }

    pub async fn add(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: u32,
    ) -> Result<Receipt, CitrineError> {
        self.store(Opcode::Add, key, value.into(), ttl, 0).await
    }

    pub async fn replace(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: u32,
    ) -> Result<Receipt, CitrineError> {
        self.store(Opcode::Replace, key, value.into(), ttl, 0).await
    }

    /// Stores only if the CAS token still matches; a mismatch surfaces as a
    /// status error.
    pub async fn cas(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        cas: u64,
        ttl: u32,
    ) -> Result<Receipt, CitrineError> {
        self.store(Opcode::Set, key, value.into(), ttl, cas).await
    }

    pub async fn append(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
    ) -> Result<Receipt, CitrineError> {
        self.concat(Opcode::Append, key, value.into()).await
    }

    pub async fn prepend(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
    ) -> Result<Receipt, CitrineError> {
        self.concat(Opcode::Prepend, key, value.into()).await
    }

    // -- Counter operations --------------------------------------------------

    /// Increments an existing counter. The key is not auto-created; a missing
    /// key is a status error here, unlike `get`.
    pub async fn incr(&self, key: &str, delta: u64) -> Result<Counter, CitrineError> {
        self.counter(Opcode::Increment, key, delta, 0, NO_AUTO_CREATE)
            .await
    }

    /// Increment with auto-create: a missing key is seeded with `initial`.
    pub async fn incr_with(
        &self,
        key: &str,
        delta: u64,
        initial: u64,
        ttl: u32,
    ) -> Result<Counter, CitrineError> {
        self.counter(Opcode::Increment, key, delta, initial, ttl).await
    }

    pub async fn decr(&self, key: &str, delta: u64) -> Result<Counter, CitrineError> {
        self.counter(Opcode::Decrement, key, delta, 0, NO_AUTO_CREATE)
            .await
    }

    pub async fn decr_with(
        &self,
        key: &str,
        delta: u64,
        initial: u64,
        ttl: u32,
    ) -> Result<Counter, CitrineError> {
        self.counter(Opcode::Decrement, key, delta, initial, ttl).await
    }

    // -- Key lifetime operations ---------------------------------------------

    /// Refreshes a key's expiry. A missing key is benign, like `get`.
    pub async fn touch(&self, key: &str, ttl: u32) -> Result<Receipt, CitrineError> {
        let command = Command::new(Opcode::Touch, self.wire_key(key)).with_expiry(ttl);
        let response = self.send_command(command).await?;
        if response.status == Status::KeyNotFound {
            return Ok(Receipt {
                cas: 0,
                status: response.status,
            });
        }
        check_status(&response, key)?;
        Ok(Receipt {
            cas: response.cas,
            status: response.status,
        })
    }

    /// Deletes a key. A missing key is benign, like `get`.
    pub async fn del(&self, key: &str) -> Result<Receipt, CitrineError> {
        let response = self
            .send_command(Command::new(Opcode::Delete, self.wire_key(key)))
            .await?;
        if response.status == Status::KeyNotFound {
            return Ok(Receipt {
                cas: 0,
                status: response.status,
            });
        }
        check_status(&response, key)?;
        Ok(Receipt {
            cas: response.cas,
            status: response.status,
        })
    }

    // -- Quiet (fire-and-forget) operations ----------------------------------
    //
    // Quiet commands use the protocol's quiet opcodes, so the server
    // suppresses success acknowledgements, and no response handler is
    // registered at all. Only routing failures surface, synchronously.

    pub fn set_quiet(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: u32,
    ) -> Result<(), CitrineError> {
        self.store_quiet(Opcode::SetQ, key, value.into(), ttl)
    }

    pub fn add_quiet(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: u32,
    ) -> Result<(), CitrineError> {
        self.store_quiet(Opcode::AddQ, key, value.into(), ttl)
    }

    pub fn replace_quiet(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: u32,
    ) -> Result<(), CitrineError> {
        self.store_quiet(Opcode::ReplaceQ, key, value.into(), ttl)
    }

    pub fn append_quiet(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
    ) -> Result<(), CitrineError> {
        let (payload, _) = value.into().encode()?;
        let command = Command::new(Opcode::AppendQ, self.wire_key(key)).with_value(payload);
        self.send_quiet(command)
    }

    pub fn prepend_quiet(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
    ) -> Result<(), CitrineError> {
        let (payload, _) = value.into().encode()?;
        let command = Command::new(Opcode::PrependQ, self.wire_key(key)).with_value(payload);
        self.send_quiet(command)
    }

    pub fn del_quiet(&self, key: &str) -> Result<(), CitrineError> {
        self.send_quiet(Command::new(Opcode::DeleteQ, self.wire_key(key)))
    }

    pub fn incr_quiet(
        &self,
        key: &str,
        delta: u64,
        initial: u64,
        ttl: u32,
    ) -> Result<(), CitrineError> {
        let command =
            Command::new(Opcode::IncrementQ, self.wire_key(key)).with_counter(delta, initial, ttl);
        self.send_quiet(command)
    }

    pub fn decr_quiet(
        &self,
        key: &str,
        delta: u64,
        initial: u64,
        ttl: u32,
    ) -> Result<(), CitrineError> {
        let command =
            Command::new(Opcode::DecrementQ, self.wire_key(key)).with_counter(delta, initial, ttl);
        self.send_quiet(command)
    }

    /// Shuts down every server. No further commands should be issued.
    pub fn end(&self) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down client");
        self.inner.dead_tx.lock().take();
        let topology = self.inner.topology.read();
        for server in topology.servers.values() {
            server.end();
        }
    }

    // -- Internals -----------------------------------------------------------

    async fn store(
        &self,
        opcode: Opcode,
        key: &str,
        value: CacheValue,
        ttl: u32,
        cas: u64,
    ) -> Result<Receipt, CitrineError> {
        let (payload, flags) = value.encode()?;
        let command = Command::new(opcode, self.wire_key(key))
            .with_value(payload)
            .with_flags(flags)
            .with_expiry(ttl)
            .with_cas(cas);
        let response = self.send_command(command).await?;
        check_status(&response, key)?;
        Ok(Receipt {
            cas: response.cas,
            status: response.status,
        })
    }

    fn store_quiet(
        &self,
        opcode: Opcode,
        key: &str,
        value: CacheValue,
        ttl: u32,
    ) -> Result<(), CitrineError> {
        let (payload, flags) = value.encode()?;
        let command = Command::new(opcode, self.wire_key(key))
            .with_value(payload)
            .with_flags(flags)
            .with_expiry(ttl);
        self.send_quiet(command)
    }

    async fn concat(
        &self,
        opcode: Opcode,
        key: &str,
        value: CacheValue,
    ) -> Result<Receipt, CitrineError> {
        let (payload, _) = value.encode()?;
        let command = Command::new(opcode, self.wire_key(key)).with_value(payload);
        let response = self.send_command(command).await?;
        check_status(&response, key)?;
        Ok(Receipt {
            cas: response.cas,
            status: response.status,
        })
    }

    async fn counter(
        &self,
        opcode: Opcode,
        key: &str,
        delta: u64,
        initial: u64,
        ttl: u32,
    ) -> Result<Counter, CitrineError> {
        let command =
            Command::new(opcode, self.wire_key(key)).with_counter(delta, initial, ttl);
        let response = self.send_command(command).await?;
        check_status(&response, key)?;
        let value = match response.value.as_deref() {
            Some(data) if data.len() == 8 => u64::from_be_bytes([
                data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
            ]),
            _ => {
                return Err(CitrineError::Protocol(
                    "counter response body must be 8 bytes".to_string(),
                ));
            }
        };
        Ok(Counter {
            value,
            cas: response.cas,
            status: response.status,
        })
    }

    /// Applies the key prefix, then long-key hashing, producing the key that
    /// is both routed on and sent over the wire.
    fn wire_key(&self, key: &str) -> Bytes {
        let config = &self.inner.config;
        let prefixed: String = match &config.key_prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        };
        if config.hash_long_keys && prefixed.len() > MAX_KEY_LEN {
            let digest = Sha1::digest(prefixed.as_bytes());
            return Bytes::from(format!("{HASHED_KEY_MARKER}{}", hex::encode(digest)));
        }
        Bytes::from(prefixed)
    }

    /// Resolves the server owning a wire key.
    fn route(&self, key: &[u8]) -> Result<Server, CitrineError> {
        let topology = self.inner.topology.read();
        let member = topology
            .ring
            .get_cached(key)
            .ok_or(CitrineError::NoServerAvailable)?;
        topology
            .servers
            .get(member.as_ref())
            .cloned()
            .ok_or(CitrineError::NoServerAvailable)
    }

    async fn send_command(&self, command: Command) -> Result<Response, CitrineError> {
        if self.inner.ended.load(Ordering::Acquire) {
            return Err(CitrineError::Ended);
        }
        let server = self.route(&command.key)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        server.send_command(command, reply_tx);
        reply_rx.await.map_err(|_| CitrineError::ConnectionLost {
            host: server.host().id().to_string(),
        })?
    }

    fn send_quiet(&self, command: Command) -> Result<(), CitrineError> {
        if self.inner.ended.load(Ordering::Acquire) {
            return Err(CitrineError::Ended);
        }
        let server = self.route(&command.key)?;
        server.send_quiet(command);
        Ok(())
    }
}

fn check_status(response: &Response, key: &str) -> Result<(), CitrineError> {
    if response.status.is_success() {
        Ok(())
    } else {
        Err(CitrineError::Status {
            status: response.status,
            key: key.to_string(),
        })
    }
}

/// Reacts to server death: the single writer of the topology. The dead host's
/// ring position is inherited by the next replacement host when one is
/// configured, otherwise its key space redistributes.
async fn membership(inner: Arc<ClientInner>, mut dead_rx: mpsc::UnboundedReceiver<Host>) {
    while let Some(dead) = dead_rx.recv().await {
        if inner.ended.load(Ordering::Acquire) {
            break;
        }
        let replacement = inner.replacements.lock().pop_front();
        let dead_tx = inner.dead_tx.lock().clone();
        let mut topology = inner.topology.write();
        topology.servers.remove(dead.id());
        match (replacement, dead_tx) {
            (Some(next), Some(dead_tx)) => {
                info!(dead = %dead, replacement = %next, "replacing dead server");
                let server = Server::spawn(next.clone(), &inner.config, dead_tx);
                topology.servers.insert(next.id().to_string(), server);
                topology.ring.replace(dead.id(), next.id(), next.weight);
            }
            _ => {
                warn!(host = %dead, "removing dead server from ring");
                topology.ring.remove(dead.id());
            }
        }
    }
}
