//! Binary TLV framing used on the courier socket.
//!
//! A frame is `[command:1][length:4][fields...]` and each field is
//! `[id:1][length:2][value:length]`, all big-endian. Field order is kept
//! as-is and the same field id may appear more than once.

use std::ops::BitOr;

use thiserror::Error;

/// Size of the `[command][length]` prefix.
pub const FRAME_HEADER_LEN: usize = 5;
/// Size of the `[id][length]` prefix of every field.
pub const FIELD_HEADER_LEN: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("empty buffer, no command byte")]
    Empty,
    #[error("truncated frame header: need 5 bytes, got {0}")]
    TruncatedHeader(usize),
    #[error("truncated frame: declared {declared} body bytes, only {available} available")]
    TruncatedFrame { declared: usize, available: usize },
    #[error("truncated field header: {0} trailing bytes cannot hold a field header")]
    TruncatedFieldHeader(usize),
    #[error("field {field} declares {declared} bytes but only {remaining} remain")]
    FieldOverrun { field: u8, declared: usize, remaining: usize },
    #[error("field {field} is {len} bytes, larger than the 16-bit length prefix allows")]
    FieldTooLong { field: u8, len: usize },
    #[error("frame body is {0} bytes, larger than the 32-bit length prefix allows")]
    FrameTooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    Connect = 7,
    ConnectAck = 8,
    FilterTopics = 9,
    SendMessage = 10,
    SendMessageAck = 11,
    KeepAlive = 12,
    KeepAliveAck = 13,
    FilterTopicsAck = 14,
    SetState = 20,
}

impl TryFrom<u8> for CommandId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            7 => CommandId::Connect,
            8 => CommandId::ConnectAck,
            9 => CommandId::FilterTopics,
            10 => CommandId::SendMessage,
            11 => CommandId::SendMessageAck,
            12 => CommandId::KeepAlive,
            13 => CommandId::KeepAliveAck,
            14 => CommandId::FilterTopicsAck,
            20 => CommandId::SetState,
            other => return Err(other),
        })
    }
}

impl From<CommandId> for u8 {
    fn from(value: CommandId) -> Self {
        value as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub id: u8,
    pub value: Vec<u8>,
}

impl Field {
    pub fn new(id: u8, value: impl Into<Vec<u8>>) -> Self {
        Field { id, value: value.into() }
    }
}

/// One unit on the wire. An `id` of zero is the "no command" sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub id: u8,
    pub fields: Vec<Field>,
}

impl Frame {
    pub fn new(command: CommandId) -> Self {
        Frame { id: command.into(), fields: vec![] }
    }

    pub fn with_field(mut self, id: u8, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push(Field::new(id, value));
        self
    }

    pub fn push_field(&mut self, id: u8, value: impl Into<Vec<u8>>) {
        self.fields.push(Field::new(id, value));
    }

    /// `true` for the zero-id sentinel frame.
    pub fn is_empty(&self) -> bool {
        self.id == 0
    }

    pub fn command(&self) -> Option<CommandId> {
        CommandId::try_from(self.id).ok()
    }

    /// Value of the first field carrying `id`.
    pub fn find_field(&self, id: u8) -> Option<&[u8]> {
        self.fields.iter().find(|f| f.id == id).map(|f| f.value.as_slice())
    }

    pub fn fields_with(&self, id: u8) -> impl Iterator<Item = &[u8]> {
        self.fields.iter().filter(move |f| f.id == id).map(|f| f.value.as_slice())
    }

    fn body_len(&self) -> usize {
        self.fields.iter().map(|f| FIELD_HEADER_LEN + f.value.len()).sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        let body_len = self.body_len();
        let declared = u32::try_from(body_len).map_err(|_| FramingError::FrameTooLong(body_len))?;

        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body_len);
        out.push(self.id);
        out.extend_from_slice(&declared.to_be_bytes());
        for field in &self.fields {
            let len = u16::try_from(field.value.len()).map_err(|_| FramingError::FieldTooLong {
                field: field.id,
                len: field.value.len(),
            })?;
            out.push(field.id);
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&field.value);
        }
        Ok(out)
    }

    /// Decodes one frame from the front of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize), FramingError> {
        let Some(&id) = buf.first() else {
            return Err(FramingError::Empty);
        };
        if id == 0 {
            return Ok((Frame::default(), 1));
        }
        if buf.len() < FRAME_HEADER_LEN {
            return Err(FramingError::TruncatedHeader(buf.len()));
        }
        let declared = read_frame_len(&buf[1..FRAME_HEADER_LEN]);
        let available = buf.len() - FRAME_HEADER_LEN;
        if declared > available {
            return Err(FramingError::TruncatedFrame { declared, available });
        }
        let end = FRAME_HEADER_LEN + declared;
        let fields = decode_fields(&buf[FRAME_HEADER_LEN..end])?;
        Ok((Frame { id, fields }, end))
    }
}

pub(crate) fn read_frame_len(header: &[u8]) -> usize {
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[..4]);
    u32::from_be_bytes(len) as usize
}

/// Splits a frame body into its fields. The body must be consumed exactly.
pub fn decode_fields(mut body: &[u8]) -> Result<Vec<Field>, FramingError> {
    let mut fields = vec![];
    while !body.is_empty() {
        if body.len() < FIELD_HEADER_LEN {
            return Err(FramingError::TruncatedFieldHeader(body.len()));
        }
        let id = body[0];
        let declared = u16::from_be_bytes([body[1], body[2]]) as usize;
        let rest = &body[FIELD_HEADER_LEN..];
        let Some(value) = rest.get(..declared) else {
            return Err(FramingError::FieldOverrun { field: id, declared, remaining: rest.len() });
        };
        fields.push(Field::new(id, value));
        body = &rest[declared..];
    }
    Ok(fields)
}

/// Capability bitmask sent in the connect frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionFlags(pub u32);

impl ConnectionFlags {
    pub const BASE: ConnectionFlags = ConnectionFlags(0b1000001);
    pub const ROOT: ConnectionFlags = ConnectionFlags(0b100);

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl BitOr for ConnectionFlags {
    type Output = ConnectionFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ConnectionFlags(self.0 | rhs.0)
    }
}
