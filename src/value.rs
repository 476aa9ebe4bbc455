// src/value.rs

//! Typed value classification for stored payloads.
//!
//! Every stored value carries a small flag tag telling readers how to decode
//! the byte payload back into an application-level type. Classification
//! happens once at the API boundary; the tag travels with the command and
//! response rather than being re-inferred.

use crate::errors::CitrineError;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Wire flag tags. Values and ordering are fixed by the stored-data format;
/// changing them would misread existing cache entries.
pub mod flags {
    pub const STRING: u32 = 0;
    pub const BINARY: u32 = 1;
    pub const NUMBER: u32 = 2;
    pub const DATE: u32 = 3;
    pub const BOOL: u32 = 4;
    pub const JSON: u32 = 5;
}

/// An application-level value, classified into one of the supported flag
/// types.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Binary(Bytes),
    Number(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    Text(String),
    Json(serde_json::Value),
}

impl CacheValue {
    /// The flag tag stored alongside this value.
    pub fn flag(&self) -> u32 {
        match self {
            CacheValue::Text(_) => flags::STRING,
            CacheValue::Binary(_) => flags::BINARY,
            CacheValue::Number(_) => flags::NUMBER,
            CacheValue::Date(_) => flags::DATE,
            CacheValue::Bool(_) => flags::BOOL,
            CacheValue::Json(_) => flags::JSON,
        }
    }

    /// Encodes the value into its wire payload and flag tag.
    pub(crate) fn encode(&self) -> Result<(Bytes, u32), CitrineError> {
        let payload = match self {
            CacheValue::Binary(data) => data.clone(),
            CacheValue::Number(n) => Bytes::from(format_number(*n)),
            CacheValue::Bool(true) => Bytes::from_static(b"1"),
            CacheValue::Bool(false) => Bytes::from_static(b"0"),
            CacheValue::Date(at) => {
                let mut buf = itoa::Buffer::new();
                Bytes::from(buf.format(at.timestamp_millis()).to_owned())
            }
            CacheValue::Text(text) => Bytes::from(text.clone()),
            CacheValue::Json(value) => Bytes::from(serde_json::to_vec(value)?),
        };
        Ok((payload, self.flag()))
    }

    /// Decodes a wire payload according to its flag tag. Unknown tags fall
    /// back to raw bytes.
    pub(crate) fn decode(flag: u32, data: Bytes) -> Result<CacheValue, CitrineError> {
        match flag {
            flags::STRING => Ok(CacheValue::Text(utf8(data)?)),
            flags::NUMBER => {
                let text = utf8(data)?;
                let number = text
                    .parse::<f64>()
                    .map_err(|_| CitrineError::Protocol(format!("invalid numeric payload '{text}'")))?;
                Ok(CacheValue::Number(number))
            }
            flags::BOOL => Ok(CacheValue::Bool(data.as_ref() == b"1")),
            flags::DATE => {
                let text = utf8(data)?;
                let millis = text
                    .parse::<i64>()
                    .map_err(|_| CitrineError::Protocol(format!("invalid date payload '{text}'")))?;
                DateTime::from_timestamp_millis(millis)
                    .map(CacheValue::Date)
                    .ok_or_else(|| {
                        CitrineError::Protocol(format!("date payload out of range: {millis}"))
                    })
            }
            flags::JSON => Ok(CacheValue::Json(serde_json::from_slice(&data)?)),
            _ => Ok(CacheValue::Binary(data)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CacheValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            CacheValue::Binary(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CacheValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CacheValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            CacheValue::Date(at) => Some(*at),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            CacheValue::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Integral doubles print without a fractional part so counters written as
/// numbers stay server-incrementable.
fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= (i64::MAX as f64) {
        let mut buf = itoa::Buffer::new();
        buf.format(n as i64).to_owned()
    } else {
        let mut buf = ryu::Buffer::new();
        buf.format(n).to_owned()
    }
}

fn utf8(data: Bytes) -> Result<String, CitrineError> {
    String::from_utf8(data.to_vec())
        .map_err(|_| CitrineError::Protocol("value is not valid UTF-8".to_string()))
}

impl From<&str> for CacheValue {
    fn from(text: &str) -> Self {
        CacheValue::Text(text.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(text: String) -> Self {
        CacheValue::Text(text)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(data: Vec<u8>) -> Self {
        CacheValue::Binary(Bytes::from(data))
    }
}

impl From<Bytes> for CacheValue {
    fn from(data: Bytes) -> Self {
        CacheValue::Binary(data)
    }
}

impl From<&[u8]> for CacheValue {
    fn from(data: &[u8]) -> Self {
        CacheValue::Binary(Bytes::copy_from_slice(data))
    }
}

impl From<f64> for CacheValue {
    fn from(n: f64) -> Self {
        CacheValue::Number(n)
    }
}

impl From<i64> for CacheValue {
    fn from(n: i64) -> Self {
        CacheValue::Number(n as f64)
    }
}

impl From<bool> for CacheValue {
    fn from(b: bool) -> Self {
        CacheValue::Bool(b)
    }
}

impl From<DateTime<Utc>> for CacheValue {
    fn from(at: DateTime<Utc>) -> Self {
        CacheValue::Date(at)
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        CacheValue::Json(value)
    }
}
