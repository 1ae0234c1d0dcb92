// ABOUTME: SMPP v3.4 wire primitives: 16-byte PDU header, command ids and statuses
// ABOUTME: C-Octet string helpers and the codec error type shared by the PDU encoders

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::io::Cursor;
use thiserror::Error;

/// Maximum accepted PDU size
pub const MAX_PDU_SIZE: u32 = 65536;

/// Command ids of the PDUs the transport speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum CommandId {
    GenericNack = 0x8000_0000,
    SubmitSm = 0x0000_0004,
    SubmitSmResp = 0x8000_0004,
    DeliverSm = 0x0000_0005,
    DeliverSmResp = 0x8000_0005,
    Unbind = 0x0000_0006,
    UnbindResp = 0x8000_0006,
    BindTransceiver = 0x0000_0009,
    BindTransceiverResp = 0x8000_0009,
    EnquireLink = 0x0000_0015,
    EnquireLinkResp = 0x8000_0015,
}

impl CommandId {
    /// Check if this command_id represents a response PDU
    pub fn is_response(&self) -> bool {
        u32::from(*self) & 0x8000_0000 != 0
    }
}

/// SMPP command_status values
///
/// Unknown codes decode to [`CommandStatus::UnknownError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum CommandStatus {
    Ok = 0x0000_0000,
    InvalidMsgLength = 0x0000_0001,
    InvalidCommandLength = 0x0000_0002,
    InvalidCommandId = 0x0000_0003,
    IncorrectBindStatus = 0x0000_0004,
    AlreadyBound = 0x0000_0005,
    SystemError = 0x0000_0008,
    InvalidSourceAddress = 0x0000_000A,
    InvalidDestinationAddress = 0x0000_000B,
    InvalidMessageId = 0x0000_000C,
    BindFailed = 0x0000_000D,
    InvalidPassword = 0x0000_000E,
    InvalidSystemId = 0x0000_000F,
    MessageQueueFull = 0x0000_0014,
    SubmitFailed = 0x0000_0045,
    Throttled = 0x0000_0058,
    DeliveryFailed = 0x0000_00FE,
    #[num_enum(default)]
    UnknownError = 0x0000_00FF,
}

/// SMPP v3.4 PDU header (16 bytes, common to all PDUs)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub command_length: u32,
    pub command_id: CommandId,
    pub command_status: CommandStatus,
    pub sequence_number: u32,
}

impl PduHeader {
    pub const SIZE: usize = 16;

    /// Decode and validate a header
    pub fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        if buf.remaining() < Self::SIZE {
            return Err(CodecError::Incomplete);
        }

        let command_length = buf.get_u32();
        let raw_id = buf.get_u32();
        let raw_status = buf.get_u32();
        let sequence_number = buf.get_u32();

        if !(Self::SIZE as u32..=MAX_PDU_SIZE).contains(&command_length) {
            return Err(CodecError::InvalidPduLength {
                length: command_length,
                min: Self::SIZE as u32,
                max: MAX_PDU_SIZE,
            });
        }

        let command_id =
            CommandId::try_from(raw_id).map_err(|_| CodecError::InvalidCommandId(raw_id))?;

        Ok(PduHeader {
            command_length,
            command_id,
            command_status: CommandStatus::from(raw_status),
            sequence_number,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.command_length);
        buf.put_u32(self.command_id.into());
        buf.put_u32(self.command_status.into());
        buf.put_u32(self.sequence_number);
    }
}

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Incomplete PDU: need more data")]
    Incomplete,

    #[error("Invalid command_id: {0:#x}")]
    InvalidCommandId(u32),

    #[error("Invalid PDU length: {length}, must be {min}-{max}")]
    InvalidPduLength { length: u32, min: u32, max: u32 },

    #[error("Field '{field}' validation failed: {reason}")]
    FieldValidation { field: &'static str, reason: String },

    #[error("UTF-8 decoding error in field '{field}': {source}")]
    Utf8Error {
        field: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

/// Read a NUL-terminated C-Octet string of at most `max_len` bytes (terminator included)
pub fn decode_cstring(
    buf: &mut Cursor<&[u8]>,
    max_len: usize,
    field: &'static str,
) -> Result<String, CodecError> {
    let rest = &buf.get_ref()[buf.position() as usize..];
    let end = match rest.iter().position(|&b| b == 0) {
        Some(end) => end,
        None if rest.len() >= max_len => {
            return Err(CodecError::FieldValidation {
                field,
                reason: format!("missing terminator within {max_len} bytes"),
            });
        }
        None => return Err(CodecError::Incomplete),
    };
    if end >= max_len {
        return Err(CodecError::FieldValidation {
            field,
            reason: format!("longer than {} bytes", max_len - 1),
        });
    }

    let value = String::from_utf8(rest[..end].to_vec())
        .map_err(|source| CodecError::Utf8Error { field, source })?;
    buf.advance(end + 1);
    Ok(value)
}

/// Write a C-Octet string, truncated to `max_len - 1` bytes plus the terminator
pub fn encode_cstring(buf: &mut BytesMut, value: &str, max_len: usize) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(max_len.saturating_sub(1));
    buf.put_slice(&bytes[..len]);
    buf.put_u8(0);
}

pub fn decode_u8(buf: &mut Cursor<&[u8]>) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.get_u8())
}
