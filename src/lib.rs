// src/lib.rs

//! # citrine
//!
//! Asynchronous memcached binary-protocol client with consistent-hash
//! routing, per-host connection pooling, offline queueing, and automatic
//! failover to replacement hosts.
//!
//! ```no_run
//! use citrine::{Client, ClientConfig};
//!
//! # async fn example() -> Result<(), citrine::CitrineError> {
//! let client = Client::new(&["127.0.0.1:11211", "127.0.0.1:11212"], ClientConfig::default())?;
//! client.set("greeting", "hello", 300).await?;
//! let lookup = client.get("greeting").await?;
//! assert_eq!(lookup.value.unwrap().as_str(), Some("hello"));
//! client.end();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod host;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod value;

pub use crate::client::{Client, Counter, Lookup, NO_AUTO_CREATE, RawLookup, Receipt};
pub use crate::config::ClientConfig;
pub use crate::errors::CitrineError;
pub use crate::host::Host;
pub use crate::protocol::Status;
pub use crate::value::CacheValue;
