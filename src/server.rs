// src/server.rs

//! Per-host connection pool: load distribution, offline queueing, and outage
//! detection.
//!
//! A `Server` owns a fixed pool of [`Connection`]s to one host plus a monitor
//! task that folds the pool's per-link liveness into a single up/down state.
//! Commands are dispatched to the first connected pool member, scanning from a
//! random offset so load spreads evenly without per-request bookkeeping. When
//! nothing is connected, commands are buffered in the offline queue (when
//! enabled) and drained in FIFO order on reconnect. A configurable grace
//! period turns a lasting outage into a "dead" notification to the owner.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionOptions, Dispatch, ReplySender};
use crate::errors::CitrineError;
use crate::host::Host;
use crate::protocol::Command;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Aggregate pool state, published for callers that need to await readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Connecting,
    Connected,
    Disconnected,
    Ended,
}

/// A command waiting for a usable connection. Quiet commands queue without a
/// reply channel.
struct QueuedCommand {
    command: Command,
    reply: Option<ReplySender>,
}

struct ServerShared {
    host: Host,
    connections: Vec<Connection>,
    connected: AtomicBool,
    ended: AtomicBool,
    offline_queue: Option<Mutex<VecDeque<QueuedCommand>>>,
    state_tx: watch::Sender<ServerState>,
}

/// Handle to a per-host pool; cheap to clone.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Builds the pool and spawns the liveness monitor. A lasting outage
    /// (see `remove_timeout`) sends the host on `dead_tx` exactly once.
    pub fn spawn(
        host: Host,
        config: &ClientConfig,
        dead_tx: mpsc::UnboundedSender<Host>,
    ) -> Server {
        let options = ConnectionOptions {
            retry_delay: config.retry_delay,
            socket_nodelay: config.socket_nodelay,
            socket_keepalive: config.socket_keepalive,
        };
        let (liveness_tx, liveness_rx) = mpsc::unbounded_channel();
        let pool_size = config.connections_per_server.max(1);
        let connections = (0..pool_size)
            .map(|_| Connection::spawn(host.clone(), options, liveness_tx.clone()))
            .collect();
        let (state_tx, _) = watch::channel(ServerState::Connecting);

        let shared = Arc::new(ServerShared {
            host,
            connections,
            connected: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            offline_queue: config
                .enable_offline_queue
                .then(|| Mutex::new(VecDeque::new())),
            state_tx,
        });
        tokio::spawn(monitor(
            shared.clone(),
            liveness_rx,
            dead_tx,
            config.remove_timeout,
        ));
        Server { shared }
    }

    pub fn host(&self) -> &Host {
        &self.shared.host
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::Acquire)
    }

    /// Subscribes to aggregate state transitions.
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.shared.state_tx.subscribe()
    }

    /// Dispatches a command, queueing or failing it when no connection is
    /// usable. Completion arrives on the reply channel.
    pub fn send_command(&self, command: Command, reply: ReplySender) {
        send_on(
            &self.shared,
            QueuedCommand {
                command,
                reply: Some(reply),
            },
        );
    }

    /// Fire-and-forget dispatch; no response is ever correlated.
    pub fn send_quiet(&self, command: Command) {
        send_on(
            &self.shared,
            QueuedCommand {
                command,
                reply: None,
            },
        );
    }

    /// Explicit shutdown: ends every connection and fails anything still
    /// queued.
    pub fn end(&self) {
        end_shared(&self.shared);
    }
}

fn send_on(shared: &ServerShared, entry: QueuedCommand) {
    if shared.ended.load(Ordering::Acquire) {
        fail_entry(entry, connection_lost(&shared.host));
        return;
    }

    let pool = &shared.connections;
    let target = if pool.len() == 1 {
        pool[0].is_connected().then_some(0)
    } else {
        // Random starting offset avoids always loading pool member 0.
        let offset = rand::thread_rng().gen_range(0..pool.len());
        (0..pool.len())
            .map(|i| (i + offset) % pool.len())
            .find(|&idx| pool[idx].is_connected())
    };

    if let Some(idx) = target {
        dispatch_entry(&pool[idx], entry);
        return;
    }

    match &shared.offline_queue {
        Some(queue) => {
            queue.lock().push_back(entry);
            // A connect edge may land between the pool scan and the enqueue;
            // re-checking here keeps such entries from stranding until the
            // next edge.
            if shared.connected.load(Ordering::Acquire) {
                drain_queue(shared);
            }
        }
        None => fail_entry(
            entry,
            CitrineError::NoConnectionAvailable {
                host: shared.host.id().to_string(),
            },
        ),
    }
}

fn dispatch_entry(connection: &Connection, entry: QueuedCommand) {
    match entry.reply {
        Some(reply) => connection.dispatch(Dispatch::Request(entry.command, reply)),
        None => connection.dispatch(Dispatch::Quiet(entry.command)),
    }
}

fn fail_entry(entry: QueuedCommand, error: CitrineError) {
    if let Some(reply) = entry.reply {
        let _ = reply.send(Err(error));
    }
}

fn connection_lost(host: &Host) -> CitrineError {
    CitrineError::ConnectionLost {
        host: host.id().to_string(),
    }
}

/// Recomputes aggregate liveness on every connection signal and drives the
/// removal grace period.
async fn monitor(
    shared: Arc<ServerShared>,
    mut liveness_rx: mpsc::UnboundedReceiver<()>,
    dead_tx: mpsc::UnboundedSender<Host>,
    remove_timeout: Option<Duration>,
) {
    let mut remove_deadline: Option<Instant> = None;

    loop {
        let event = match remove_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {
                        if shared.ended.load(Ordering::Acquire) {
                            break;
                        }
                        if !shared.connected.load(Ordering::Acquire) {
                            warn!(
                                host = %shared.host,
                                "no live connection within grace period, declaring host dead"
                            );
                            let _ = dead_tx.send(shared.host.clone());
                            end_shared(&shared);
                            break;
                        }
                        remove_deadline = None;
                        continue;
                    }
                    event = liveness_rx.recv() => event,
                }
            }
            None => liveness_rx.recv().await,
        };

        if event.is_none() {
            break;
        }
        if shared.ended.load(Ordering::Acquire) {
            break;
        }

        let now_connected = shared.connections.iter().any(Connection::is_connected);
        let was_connected = shared.connected.swap(now_connected, Ordering::AcqRel);

        if now_connected {
            remove_deadline = None;
            if !was_connected {
                info!(host = %shared.host, "server connected");
                let _ = shared.state_tx.send(ServerState::Connected);
                drain_queue(&shared);
            }
        } else {
            if was_connected {
                let _ = shared.state_tx.send(ServerState::Disconnected);
            }
            match remove_timeout {
                Some(timeout) if remove_deadline.is_none() => {
                    remove_deadline = Some(Instant::now() + timeout);
                }
                Some(_) => {}
                None => {
                    debug!(host = %shared.host, "server disconnected, awaiting reconnect")
                }
            }
        }
    }
}

/// Drains the offline queue in FIFO order. Entries are resubmitted through
/// the normal dispatch path so they re-enter load balancing.
fn drain_queue(shared: &ServerShared) {
    let Some(queue) = &shared.offline_queue else {
        return;
    };
    let drained = std::mem::take(&mut *queue.lock());
    if drained.is_empty() {
        return;
    }
    debug!(
        host = %shared.host,
        count = drained.len(),
        "draining offline queue"
    );
    for entry in drained {
        send_on(shared, entry);
    }
}

fn end_shared(shared: &ServerShared) {
    if shared.ended.swap(true, Ordering::AcqRel) {
        return;
    }
    for connection in &shared.connections {
        connection.end();
    }
    if let Some(queue) = &shared.offline_queue {
        for entry in std::mem::take(&mut *queue.lock()) {
            fail_entry(entry, connection_lost(&shared.host));
        }
    }
    shared.connected.store(false, Ordering::Release);
    let _ = shared.state_tx.send(ServerState::Ended);
}
