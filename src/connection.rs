// src/connection.rs

//! A single TCP link to one cache host.
//!
//! Each `Connection` is backed by a spawned task that owns the socket, the
//! pending-request table, and the correlation counter. Outbound commands are
//! handed to the task through an unbounded channel; each non-quiet command is
//! tagged with the next correlation value and its reply channel is stored
//! until the matching response arrives. On link loss every in-flight request
//! is failed exactly once, then the task sleeps for the fixed retry delay and
//! reconnects. Connections are never recreated, only reconnected in place;
//! `end` is terminal.

use crate::errors::CitrineError;
use crate::host::Host;
use crate::protocol::{Command, PacketCodec, Response};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Correlation tags wrap back to zero above this bound. Collisions are
/// impossible in practice: the table never holds anywhere near this many
/// in-flight requests.
const OPAQUE_WRAP: u32 = 2_000_000_000;

/// Reply channel for a single request.
pub type ReplySender = oneshot::Sender<Result<Response, CitrineError>>;

/// A unit of work handed to the connection task.
pub enum Dispatch {
    /// Request expecting a response, resolved through the reply channel.
    Request(Command, ReplySender),
    /// Fire-and-forget request; no pending entry is registered.
    Quiet(Command),
    /// Terminal shutdown.
    End,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub retry_delay: Duration,
    pub socket_nodelay: bool,
    pub socket_keepalive: bool,
}

struct ConnectionShared {
    host: Host,
    connected: AtomicBool,
    ended: AtomicBool,
}

/// Handle to a connection task; cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
}

impl Connection {
    /// Spawns the link task. Liveness transitions (and failed connect
    /// attempts) are signalled on `liveness_tx` for the owner to aggregate.
    pub fn spawn(
        host: Host,
        options: ConnectionOptions,
        liveness_tx: mpsc::UnboundedSender<()>,
    ) -> Connection {
        let shared = Arc::new(ConnectionShared {
            host,
            connected: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        });
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(shared.clone(), options, dispatch_rx, liveness_tx));
        Connection {
            shared,
            dispatch_tx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::Acquire)
    }

    pub fn host(&self) -> &Host {
        &self.shared.host
    }

    /// Hands a unit of work to the link task. A request that cannot reach the
    /// task (already ended) fails its reply channel immediately.
    pub fn dispatch(&self, dispatch: Dispatch) {
        if let Err(mpsc::error::SendError(rejected)) = self.dispatch_tx.send(dispatch) {
            if let Dispatch::Request(_, reply) = rejected {
                let _ = reply.send(Err(connection_lost(&self.shared.host)));
            }
        }
    }

    /// Terminal shutdown: cancels any pending retry and closes the socket.
    pub fn end(&self) {
        self.dispatch(Dispatch::End);
    }
}

fn connection_lost(host: &Host) -> CitrineError {
    CitrineError::ConnectionLost {
        host: host.id().to_string(),
    }
}

enum LinkExit {
    Lost,
    Ended,
}

async fn run(
    shared: Arc<ConnectionShared>,
    options: ConnectionOptions,
    mut dispatch_rx: mpsc::UnboundedReceiver<Dispatch>,
    liveness_tx: mpsc::UnboundedSender<()>,
) {
    // The correlation counter survives reconnects; the pending table does not.
    let mut seq: u32 = 0;
    loop {
        match connect_stream(&shared.host, &options).await {
            Ok(stream) => {
                debug!(host = %shared.host, "link established");
                shared.connected.store(true, Ordering::Release);
                let _ = liveness_tx.send(());

                let framed = Framed::new(stream, PacketCodec);
                let exit = run_link(&shared, framed, &mut dispatch_rx, &mut seq).await;

                shared.connected.store(false, Ordering::Release);
                let _ = liveness_tx.send(());
                if matches!(exit, LinkExit::Ended) {
                    break;
                }
                warn!(
                    host = %shared.host,
                    "link lost, retrying in {:?}", options.retry_delay
                );
            }
            Err(e) => {
                warn!(
                    host = %shared.host,
                    error = %e,
                    "connect failed, retrying in {:?}", options.retry_delay
                );
                // The owner still needs a signal: a never-connected host must
                // be able to trip the removal grace period.
                let _ = liveness_tx.send(());
            }
        }

        if matches!(
            wait_retry(&shared, options.retry_delay, &mut dispatch_rx).await,
            LinkExit::Ended
        ) {
            break;
        }
    }

    shared.connected.store(false, Ordering::Release);
    shared.ended.store(true, Ordering::Release);
    let _ = liveness_tx.send(());
    debug!(host = %shared.host, "connection ended");
}

/// Opens and tunes the socket.
async fn connect_stream(
    host: &Host,
    options: &ConnectionOptions,
) -> Result<TcpStream, CitrineError> {
    let mut last_err: Option<io::Error> = None;
    for addr in tokio::net::lookup_host((host.host.as_str(), host.port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(options.socket_keepalive)?;
        match socket.connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(options.socket_nodelay)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"))
        .into())
}

/// Services one live link until it drops or the connection is ended.
async fn run_link(
    shared: &ConnectionShared,
    mut framed: Framed<TcpStream, PacketCodec>,
    dispatch_rx: &mut mpsc::UnboundedReceiver<Dispatch>,
    seq: &mut u32,
) -> LinkExit {
    let mut pending: HashMap<u32, ReplySender> = HashMap::new();

    let exit = loop {
        tokio::select! {
            maybe = dispatch_rx.recv() => match maybe {
                Some(Dispatch::Request(mut command, reply)) => {
                    let opaque = next_opaque(seq);
                    command.opaque = opaque;
                    pending.insert(opaque, reply);
                    if let Err(e) = framed.send(command).await {
                        warn!(host = %shared.host, error = %e, "write failed");
                        break LinkExit::Lost;
                    }
                }
                Some(Dispatch::Quiet(mut command)) => {
                    command.opaque = next_opaque(seq);
                    if let Err(e) = framed.send(command).await {
                        warn!(host = %shared.host, error = %e, "write failed");
                        break LinkExit::Lost;
                    }
                }
                Some(Dispatch::End) | None => break LinkExit::Ended,
            },
            frame = framed.next() => match frame {
                Some(Ok(response)) => match pending.remove(&response.opaque) {
                    Some(reply) => {
                        let _ = reply.send(Ok(response));
                    }
                    None => warn!(
                        host = %shared.host,
                        opaque = response.opaque,
                        "unexpected packet received from server"
                    ),
                },
                Some(Err(e)) => {
                    warn!(host = %shared.host, error = %e, "protocol error on link");
                    break LinkExit::Lost;
                }
                None => {
                    debug!(host = %shared.host, "connection closed by peer");
                    break LinkExit::Lost;
                }
            },
        }
    };

    // Every in-flight request fails exactly once, before the retry timer
    // starts.
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(connection_lost(&shared.host)));
    }
    let _ = framed.close().await;
    exit
}

/// Sleeps out the retry delay, failing any requests that race in while the
/// link is down.
async fn wait_retry(
    shared: &ConnectionShared,
    delay: Duration,
    dispatch_rx: &mut mpsc::UnboundedReceiver<Dispatch>,
) -> LinkExit {
    let sleeper = sleep(delay);
    tokio::pin!(sleeper);
    loop {
        tokio::select! {
            _ = &mut sleeper => return LinkExit::Lost,
            maybe = dispatch_rx.recv() => match maybe {
                Some(Dispatch::Request(_, reply)) => {
                    let _ = reply.send(Err(connection_lost(&shared.host)));
                }
                Some(Dispatch::Quiet(_)) => {}
                Some(Dispatch::End) | None => return LinkExit::Ended,
            },
        }
    }
}

fn next_opaque(seq: &mut u32) -> u32 {
    if *seq > OPAQUE_WRAP {
        *seq = 0;
    }
    let opaque = *seq;
    *seq += 1;
    opaque
}
