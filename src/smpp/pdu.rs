// ABOUTME: SMPP PDU bodies used by the transceiver session and their framing
// ABOUTME: Encodes bind/submit/enquire/unbind requests and decodes SMSC responses and deliver_sm

use super::codec::{
    CodecError, CommandId, CommandStatus, PduHeader, decode_cstring, decode_u8, encode_cstring,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// Short message fields shared by submit_sm and deliver_sm
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShortMessage {
    pub service_type: String,
    pub source_addr_ton: u8,
    pub source_addr_npi: u8,
    pub source_addr: String,
    pub dest_addr_ton: u8,
    pub dest_addr_npi: u8,
    pub destination_addr: String,
    pub esm_class: u8,
    pub protocol_id: u8,
    pub priority_flag: u8,
    pub schedule_delivery_time: String,
    pub validity_period: String,
    pub registered_delivery: u8,
    pub replace_if_present_flag: u8,
    pub data_coding: u8,
    pub sm_default_msg_id: u8,
    pub short_message: Bytes,
}

/// esm_class bit marking a user data header in `short_message`
pub const ESM_UDHI: u8 = 0x40;
/// esm_class bit marking a deliver_sm as an SMSC delivery receipt
pub const ESM_DELIVERY_RECEIPT: u8 = 0x04;

impl ShortMessage {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        if self.short_message.len() > 254 {
            return Err(CodecError::FieldValidation {
                field: "short_message",
                reason: format!("{} bytes exceeds 254", self.short_message.len()),
            });
        }
        encode_cstring(buf, &self.service_type, 6);
        buf.put_u8(self.source_addr_ton);
        buf.put_u8(self.source_addr_npi);
        encode_cstring(buf, &self.source_addr, 21);
        buf.put_u8(self.dest_addr_ton);
        buf.put_u8(self.dest_addr_npi);
        encode_cstring(buf, &self.destination_addr, 21);
        buf.put_u8(self.esm_class);
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.priority_flag);
        encode_cstring(buf, &self.schedule_delivery_time, 17);
        encode_cstring(buf, &self.validity_period, 17);
        buf.put_u8(self.registered_delivery);
        buf.put_u8(self.replace_if_present_flag);
        buf.put_u8(self.data_coding);
        buf.put_u8(self.sm_default_msg_id);
        buf.put_u8(self.short_message.len() as u8);
        buf.put_slice(&self.short_message);
        Ok(())
    }

    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let service_type = decode_cstring(buf, 6, "service_type")?;
        let source_addr_ton = decode_u8(buf)?;
        let source_addr_npi = decode_u8(buf)?;
        let source_addr = decode_cstring(buf, 21, "source_addr")?;
        let dest_addr_ton = decode_u8(buf)?;
        let dest_addr_npi = decode_u8(buf)?;
        let destination_addr = decode_cstring(buf, 21, "destination_addr")?;
        let esm_class = decode_u8(buf)?;
        let protocol_id = decode_u8(buf)?;
        let priority_flag = decode_u8(buf)?;
        let schedule_delivery_time = decode_cstring(buf, 17, "schedule_delivery_time")?;
        let validity_period = decode_cstring(buf, 17, "validity_period")?;
        let registered_delivery = decode_u8(buf)?;
        let replace_if_present_flag = decode_u8(buf)?;
        let data_coding = decode_u8(buf)?;
        let sm_default_msg_id = decode_u8(buf)?;
        let sm_length = decode_u8(buf)? as usize;
        if buf.remaining() < sm_length {
            return Err(CodecError::Incomplete);
        }
        let short_message = buf.copy_to_bytes(sm_length);

        Ok(ShortMessage {
            service_type,
            source_addr_ton,
            source_addr_npi,
            source_addr,
            dest_addr_ton,
            dest_addr_npi,
            destination_addr,
            esm_class,
            protocol_id,
            priority_flag,
            schedule_delivery_time,
            validity_period,
            registered_delivery,
            replace_if_present_flag,
            data_coding,
            sm_default_msg_id,
            short_message,
        })
    }
}

/// PDU bodies understood by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    BindTransceiver {
        system_id: String,
        password: String,
        system_type: String,
    },
    BindTransceiverResp {
        system_id: String,
    },
    SubmitSm(Box<ShortMessage>),
    SubmitSmResp {
        message_id: String,
    },
    DeliverSm(Box<ShortMessage>),
    DeliverSmResp,
    EnquireLink,
    EnquireLinkResp,
    Unbind,
    UnbindResp,
    GenericNack,
}

impl Pdu {
    pub fn command_id(&self) -> CommandId {
        match self {
            Pdu::BindTransceiver { .. } => CommandId::BindTransceiver,
            Pdu::BindTransceiverResp { .. } => CommandId::BindTransceiverResp,
            Pdu::SubmitSm(_) => CommandId::SubmitSm,
            Pdu::SubmitSmResp { .. } => CommandId::SubmitSmResp,
            Pdu::DeliverSm(_) => CommandId::DeliverSm,
            Pdu::DeliverSmResp => CommandId::DeliverSmResp,
            Pdu::EnquireLink => CommandId::EnquireLink,
            Pdu::EnquireLinkResp => CommandId::EnquireLinkResp,
            Pdu::Unbind => CommandId::Unbind,
            Pdu::UnbindResp => CommandId::UnbindResp,
            Pdu::GenericNack => CommandId::GenericNack,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            Pdu::BindTransceiver {
                system_id,
                password,
                system_type,
            } => {
                encode_cstring(buf, system_id, 16);
                encode_cstring(buf, password, 9);
                encode_cstring(buf, system_type, 13);
                buf.put_u8(0x34); // interface_version 3.4
                buf.put_u8(0); // addr_ton
                buf.put_u8(0); // addr_npi
                encode_cstring(buf, "", 41); // address_range
            }
            Pdu::BindTransceiverResp { system_id } => encode_cstring(buf, system_id, 16),
            Pdu::SubmitSm(sm) | Pdu::DeliverSm(sm) => sm.encode(buf)?,
            Pdu::SubmitSmResp { message_id } => encode_cstring(buf, message_id, 65),
            Pdu::DeliverSmResp => encode_cstring(buf, "", 1),
            Pdu::EnquireLink
            | Pdu::EnquireLinkResp
            | Pdu::Unbind
            | Pdu::UnbindResp
            | Pdu::GenericNack => {}
        }
        Ok(())
    }

    fn decode_body(header: &PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        // Error responses may come without a body
        let empty = buf.remaining() == 0;
        let pdu = match header.command_id {
            CommandId::BindTransceiver => {
                let system_id = decode_cstring(buf, 16, "system_id")?;
                let password = decode_cstring(buf, 9, "password")?;
                let system_type = decode_cstring(buf, 13, "system_type")?;
                Pdu::BindTransceiver {
                    system_id,
                    password,
                    system_type,
                }
            }
            CommandId::BindTransceiverResp => Pdu::BindTransceiverResp {
                system_id: if empty {
                    String::new()
                } else {
                    decode_cstring(buf, 16, "system_id")?
                },
            },
            CommandId::SubmitSm => Pdu::SubmitSm(Box::new(ShortMessage::decode(buf)?)),
            CommandId::SubmitSmResp => Pdu::SubmitSmResp {
                message_id: if empty {
                    String::new()
                } else {
                    decode_cstring(buf, 65, "message_id")?
                },
            },
            CommandId::DeliverSm => Pdu::DeliverSm(Box::new(ShortMessage::decode(buf)?)),
            CommandId::DeliverSmResp => Pdu::DeliverSmResp,
            CommandId::EnquireLink => Pdu::EnquireLink,
            CommandId::EnquireLinkResp => Pdu::EnquireLinkResp,
            CommandId::Unbind => Pdu::Unbind,
            CommandId::UnbindResp => Pdu::UnbindResp,
            CommandId::GenericNack => Pdu::GenericNack,
        };
        Ok(pdu)
    }
}

/// One PDU on the wire: header fields plus body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
    pub pdu: Pdu,
}

impl Frame {
    pub fn request(sequence_number: u32, pdu: Pdu) -> Self {
        Frame {
            command_status: CommandStatus::Ok,
            sequence_number,
            pdu,
        }
    }

    pub fn response(sequence_number: u32, command_status: CommandStatus, pdu: Pdu) -> Self {
        Frame {
            command_status,
            sequence_number,
            pdu,
        }
    }

    pub fn command_id(&self) -> CommandId {
        self.pdu.command_id()
    }

    /// Check whether a complete frame is buffered; returns its length
    pub fn check(buf: &mut Cursor<&[u8]>) -> Result<usize, CodecError> {
        let start = buf.position();
        let header = PduHeader::decode(buf)?;
        buf.set_position(start);
        let len = header.command_length as usize;
        if buf.remaining() < len {
            return Err(CodecError::Incomplete);
        }
        Ok(len)
    }

    /// Parse one complete frame; the cursor ends after it
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Frame, CodecError> {
        let start = buf.position() as usize;
        let header = PduHeader::decode(buf)?;
        let end = start + header.command_length as usize;
        if buf.get_ref().len() < end {
            return Err(CodecError::Incomplete);
        }

        let body = &buf.get_ref()[start + PduHeader::SIZE..end];
        // The body is complete here, so running short means it is malformed
        let pdu = Pdu::decode_body(&header, &mut Cursor::new(body)).map_err(|e| match e {
            CodecError::Incomplete => CodecError::FieldValidation {
                field: "body",
                reason: "truncated PDU body".to_string(),
            },
            other => other,
        })?;
        buf.set_position(end as u64);

        Ok(Frame {
            command_status: header.command_status,
            sequence_number: header.sequence_number,
            pdu,
        })
    }

    /// Encode header and body; command_length is filled in from the body size
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut body = BytesMut::new();
        self.pdu.encode_body(&mut body)?;

        let mut buf = BytesMut::with_capacity(PduHeader::SIZE + body.len());
        PduHeader {
            command_length: (PduHeader::SIZE + body.len()) as u32,
            command_id: self.command_id(),
            command_status: self.command_status,
            sequence_number: self.sequence_number,
        }
        .encode(&mut buf);
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }
}

/// Fields of an SMSC delivery receipt (`id:... stat:DELIVRD ...`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceiptText {
    pub message_id: String,
    pub state: String,
}

impl DeliveryReceiptText {
    pub fn parse(text: &str) -> Option<Self> {
        let field = |key: &str| {
            text.split_whitespace()
                .find_map(|token| token.strip_prefix(key))
                .map(str::to_string)
        };
        Some(DeliveryReceiptText {
            message_id: field("id:")?,
            state: field("stat:").unwrap_or_default(),
        })
    }

    pub fn delivered(&self) -> bool {
        self.state.eq_ignore_ascii_case("DELIVRD")
    }
}

/// SMPP relative validity period (`YYMMDDhhmmsstnnR`) for a number of minutes
pub fn relative_validity(minutes: u32) -> String {
    let days = (minutes / 1440).min(99);
    let hours = (minutes % 1440) / 60;
    let mins = minutes % 60;
    format!("0000{days:02}{hours:02}{mins:02}00000R")
}
