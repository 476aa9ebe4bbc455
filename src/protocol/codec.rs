// src/protocol/codec.rs

//! Implements the binary protocol framing as a `tokio_util::codec`
//! `Encoder`/`Decoder` pair.
//!
//! Frames use a fixed 24-byte header followed by extras, key, and value
//! sections. All multi-byte fields are big-endian. The decoder is streaming:
//! it returns `Ok(None)` until a complete frame has been buffered, so frames
//! reassemble correctly across arbitrary read boundaries. The correlation tag
//! (`opaque`) is preserved unchanged across encode and decode.

use super::command::{Command, Opcode};
use super::response::{Response, Status};
use crate::errors::CitrineError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Magic byte opening every request header.
pub const REQUEST_MAGIC: u8 = 0x80;
/// Magic byte opening every response header.
pub const RESPONSE_MAGIC: u8 = 0x81;
/// Fixed header size for both directions.
pub const HEADER_SIZE: usize = 24;

/// Stateless codec for client-side framing: encodes requests, decodes
/// responses.
#[derive(Debug, Default)]
pub struct PacketCodec;

/// Number of extras bytes a request opcode writes.
fn extras_len(opcode: Opcode) -> usize {
    match opcode {
        Opcode::Set
        | Opcode::SetQ
        | Opcode::Add
        | Opcode::AddQ
        | Opcode::Replace
        | Opcode::ReplaceQ => 8,
        Opcode::Increment
        | Opcode::IncrementQ
        | Opcode::Decrement
        | Opcode::DecrementQ => 20,
        Opcode::Touch => 4,
        _ => 0,
    }
}

impl Encoder<Command> for PacketCodec {
    type Error = CitrineError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let extras_len = extras_len(item.opcode);
        let key_len = item.key.len();
        if key_len > u16::MAX as usize {
            return Err(CitrineError::Protocol(format!(
                "key length {key_len} exceeds protocol limit"
            )));
        }
        let value_len = item.value.as_ref().map_or(0, |v| v.len());
        let total_body = extras_len + key_len + value_len;

        dst.reserve(HEADER_SIZE + total_body);
        dst.put_u8(REQUEST_MAGIC);
        dst.put_u8(item.opcode as u8);
        dst.put_u16(key_len as u16);
        dst.put_u8(extras_len as u8);
        dst.put_u8(0); // data type, reserved
        dst.put_u16(0); // vbucket id, reserved
        dst.put_u32(total_body as u32);
        dst.put_u32(item.opaque);
        dst.put_u64(item.cas);

        match extras_len {
            8 => {
                dst.put_u32(item.extras.flags);
                dst.put_u32(item.extras.expiry);
            }
            20 => {
                dst.put_u64(item.extras.delta);
                dst.put_u64(item.extras.initial);
                dst.put_u32(item.extras.expiry);
            }
            4 => {
                dst.put_u32(item.extras.expiry);
            }
            _ => {}
        }

        dst.extend_from_slice(&item.key);
        if let Some(value) = &item.value {
            dst.extend_from_slice(value);
        }
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Response;
    type Error = CitrineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = src[0];
        if magic != RESPONSE_MAGIC {
            return Err(CitrineError::Protocol(format!(
                "invalid response magic byte 0x{magic:02x}"
            )));
        }

        let key_len = u16::from_be_bytes([src[2], src[3]]) as usize;
        let extras_len = src[4] as usize;
        let total_body = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;

        if src.len() < HEADER_SIZE + total_body {
            // Partial frame; ask for the remainder in one read where possible.
            src.reserve(HEADER_SIZE + total_body - src.len());
            return Ok(None);
        }

        if extras_len + key_len > total_body {
            return Err(CitrineError::Protocol(format!(
                "inconsistent body lengths (extras {extras_len} + key {key_len} > body {total_body})"
            )));
        }

        let opcode = Opcode::from_u8(src[1])
            .ok_or_else(|| CitrineError::Protocol(format!("unknown opcode 0x{:02x}", src[1])))?;
        let status = Status::from_code(u16::from_be_bytes([src[6], src[7]]));
        let opaque = u32::from_be_bytes([src[12], src[13], src[14], src[15]]);
        let cas = u64::from_be_bytes([
            src[16], src[17], src[18], src[19], src[20], src[21], src[22], src[23],
        ]);

        src.advance(HEADER_SIZE);
        let mut body = src.split_to(total_body).freeze();
        let extras = body.split_to(extras_len);
        let key = body.split_to(key_len);

        let flags = if extras.len() >= 4 {
            u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
        } else {
            0
        };

        // An empty body on a successful value-bearing opcode is still a value.
        let value = if !body.is_empty() || (status.is_success() && opcode.returns_value()) {
            Some(body)
        } else {
            None
        };

        Ok(Some(Response {
            opcode,
            status,
            key,
            value,
            flags,
            cas,
            opaque,
        }))
    }
}
