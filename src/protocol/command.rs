// src/protocol/command.rs

//! Request frames and opcodes for the memcached binary protocol.

use bytes::Bytes;

/// Binary protocol opcodes used by the client, including the quiet variants
/// that suppress success acknowledgements from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Append = 0x0E,
    Prepend = 0x0F,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    AppendQ = 0x19,
    PrependQ = 0x1A,
    Touch = 0x1C,
}

impl Opcode {
    /// Try to convert a wire byte to an opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Set),
            0x02 => Some(Opcode::Add),
            0x03 => Some(Opcode::Replace),
            0x04 => Some(Opcode::Delete),
            0x05 => Some(Opcode::Increment),
            0x06 => Some(Opcode::Decrement),
            0x0E => Some(Opcode::Append),
            0x0F => Some(Opcode::Prepend),
            0x11 => Some(Opcode::SetQ),
            0x12 => Some(Opcode::AddQ),
            0x13 => Some(Opcode::ReplaceQ),
            0x14 => Some(Opcode::DeleteQ),
            0x15 => Some(Opcode::IncrementQ),
            0x16 => Some(Opcode::DecrementQ),
            0x19 => Some(Opcode::AppendQ),
            0x1A => Some(Opcode::PrependQ),
            0x1C => Some(Opcode::Touch),
            _ => None,
        }
    }

    /// Returns the quiet variant of this opcode, or the opcode itself when no
    /// quiet form exists.
    pub fn quiet(&self) -> Opcode {
        match self {
            Opcode::Set => Opcode::SetQ,
            Opcode::Add => Opcode::AddQ,
            Opcode::Replace => Opcode::ReplaceQ,
            Opcode::Delete => Opcode::DeleteQ,
            Opcode::Increment => Opcode::IncrementQ,
            Opcode::Decrement => Opcode::DecrementQ,
            Opcode::Append => Opcode::AppendQ,
            Opcode::Prepend => Opcode::PrependQ,
            other => *other,
        }
    }

    /// Returns true if this is a "quiet" opcode (no response on success).
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            Opcode::SetQ
                | Opcode::AddQ
                | Opcode::ReplaceQ
                | Opcode::DeleteQ
                | Opcode::IncrementQ
                | Opcode::DecrementQ
                | Opcode::AppendQ
                | Opcode::PrependQ
        )
    }

    /// Returns true for opcodes whose success response carries a value body,
    /// possibly empty. Needed to round-trip empty strings.
    pub fn returns_value(&self) -> bool {
        matches!(self, Opcode::Get | Opcode::Increment | Opcode::Decrement)
    }
}

/// Optional extras attached to a request. Which fields end up on the wire is
/// determined by the opcode's extras layout, not by which fields are set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extras {
    /// Flag tag stored alongside the value (store operations).
    pub flags: u32,
    /// Expiration in seconds (store, counter, and touch operations).
    pub expiry: u32,
    /// Amount to add or subtract (counter operations).
    pub delta: u64,
    /// Value stored when a counter key does not yet exist (counter operations).
    pub initial: u64,
}

/// A single request frame. Created fresh per call; the correlation tag is
/// assigned by the connection at write time.
#[derive(Debug, Clone)]
pub struct Command {
    pub opcode: Opcode,
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub extras: Extras,
    pub cas: u64,
    pub opaque: u32,
}

impl Command {
    pub fn new(opcode: Opcode, key: Bytes) -> Self {
        Self {
            opcode,
            key,
            value: None,
            extras: Extras::default(),
            cas: 0,
            opaque: 0,
        }
    }

    pub fn with_value(mut self, value: Bytes) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.extras.flags = flags;
        self
    }

    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.extras.expiry = expiry;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_counter(mut self, delta: u64, initial: u64, expiry: u32) -> Self {
        self.extras.delta = delta;
        self.extras.initial = initial;
        self.extras.expiry = expiry;
        self
    }
}
