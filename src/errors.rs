// src/errors.rs

//! Defines the primary error type for the client.

use crate::protocol::Status;
use thiserror::Error;

/// The main error enum, representing all possible failures within the client.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum CitrineError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// The link carrying a request dropped before a response arrived, or the
    /// owning server was shut down while the request was still queued.
    #[error("Server connection lost to {host}")]
    ConnectionLost { host: String },

    /// No pooled connection was usable and the offline queue is disabled.
    #[error("Unable to acquire connection to server {host}")]
    NoConnectionAvailable { host: String },

    /// The ring resolved to a member with no live server entry.
    #[error("Unable to acquire any server connections")]
    NoServerAvailable,

    /// The remote server answered with a non-success status.
    #[error("{status} (key '{key}')")]
    Status { status: Status, key: String },

    /// A frame violated the binary protocol (bad magic, unknown opcode,
    /// inconsistent body lengths, malformed payload).
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid host '{0}'")]
    InvalidHost(String),

    /// The client or server was explicitly shut down.
    #[error("Client has been shut down")]
    Ended,

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),
}
