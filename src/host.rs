// src/host.rs

//! Host records and host-list string parsing.

use crate::errors::CitrineError;
use std::fmt;
use std::str::FromStr;

/// Default memcached port, used when a host spec omits one.
pub const DEFAULT_PORT: u16 = 11211;

/// One cache host. Identity is the `"host:port"` string, which doubles as the
/// ring member key and the Servers-map key. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    id: String,
}

impl Host {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        let host = host.into();
        let id = format!("{host}:{port}");
        Self {
            host,
            port,
            weight: weight.max(1),
            id,
        }
    }

    /// Stable string identifier (`"host:port"`).
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl FromStr for Host {
    type Err = CitrineError;

    /// Parses `"host"`, `"host:port"`, or `"host:port:weight"`.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = || CitrineError::InvalidHost(spec.to_string());
        let mut parts = spec.split(':');
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let port = match parts.next() {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };
        let weight = match parts.next() {
            Some(w) => w.parse::<u32>().map_err(|_| invalid())?,
            None => 1,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Host::new(host, port, weight))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Parses a list of host specs, preserving order.
pub fn parse_hosts<S: AsRef<str>>(specs: &[S]) -> Result<Vec<Host>, CitrineError> {
    specs.iter().map(|s| s.as_ref().parse()).collect()
}
