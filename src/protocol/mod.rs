// src/protocol/mod.rs

//! Memcached binary protocol framing: request/response frames, opcodes,
//! statuses, and the streaming codec.

mod codec;
mod command;
mod response;

pub use codec::{HEADER_SIZE, PacketCodec, REQUEST_MAGIC, RESPONSE_MAGIC};
pub use command::{Command, Extras, Opcode};
pub use response::{Response, Status};
