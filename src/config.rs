// src/config.rs

//! Client configuration: pool sizing, socket tuning, and failover behavior.
//!
//! All fields have serde defaults so the struct can be embedded in a host
//! application's configuration file and partially specified.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientConfig {
    /// Connections opened per server.
    #[serde(default = "default_connections_per_server")]
    pub connections_per_server: usize,

    /// Sets `TCP_NODELAY` on every socket.
    #[serde(default = "default_true")]
    pub socket_nodelay: bool,

    /// Sets `SO_KEEPALIVE` on every socket.
    #[serde(default = "default_true")]
    pub socket_keepalive: bool,

    /// Fixed delay between reconnection attempts after a link drops.
    /// A supplied value is used verbatim; the default applies only when unset.
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,

    /// How long a server may stay fully disconnected before it is declared
    /// dead and removed from the ring. `None` disables self-removal: the
    /// server keeps reconnecting forever.
    #[serde(with = "humantime_serde", default)]
    pub remove_timeout: Option<Duration>,

    /// Buffer commands while a server has no usable connection, draining them
    /// in order on reconnect. When disabled, such commands fail immediately.
    #[serde(default = "default_true")]
    pub enable_offline_queue: bool,

    /// Replace keys longer than the protocol limit with a fixed-width digest
    /// before routing and transport.
    #[serde(default = "default_true")]
    pub hash_long_keys: bool,

    /// Prefix applied to every key before routing.
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Standby hosts promoted into a dead server's exact ring position, in
    /// order.
    #[serde(default)]
    pub replacement_hosts: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connections_per_server: default_connections_per_server(),
            socket_nodelay: true,
            socket_keepalive: true,
            retry_delay: default_retry_delay(),
            remove_timeout: None,
            enable_offline_queue: true,
            hash_long_keys: true,
            key_prefix: None,
            replacement_hosts: Vec::new(),
        }
    }
}

fn default_connections_per_server() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(2)
}
