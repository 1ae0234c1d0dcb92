// ABOUTME: Boundary to the GSM 03.40 PDU codec used by modems running in PDU mode
// ABOUTME: The codec itself is supplied by the caller; the driver only moves hex strings around

use crate::error::SmsResult;
use crate::message::{OutboundMessage, Payload};
use chrono::{DateTime, Utc};

/// One encoded SUBMIT part, ready for `AT+CMGS=<len>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduPart {
    /// Full hex string including the SMSC field (`"00"` for the SIM default)
    pub hex: String,
    /// TPDU length in octets, excluding the SMSC field
    pub tpdu_len: usize,
}

impl PduPart {
    /// Build a part from hex whose SMSC field is the single `00` octet
    pub fn with_default_smsc(tpdu_hex: &str) -> Self {
        PduPart {
            hex: format!("00{tpdu_hex}"),
            tpdu_len: tpdu_hex.len() / 2,
        }
    }
}

/// Result of decoding a stored DELIVER or STATUS-REPORT PDU
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPdu {
    Sms {
        originator: String,
        payload: Payload,
        timestamp: Option<DateTime<Utc>>,
    },
    StatusReport {
        recipient: String,
        reference: u32,
        /// TP-Status; 0 means delivered
        status: u8,
        discharged: Option<DateTime<Utc>>,
    },
}

/// GSM 03.40 encoder/decoder
///
/// `reference` is the concatenation reference the driver allocates for
/// each outbound message; codecs use it in the UDH of multipart messages.
pub trait PduCodec: Send + Sync {
    fn encode_submit(
        &self,
        message: &OutboundMessage,
        smsc: Option<&str>,
        reference: u16,
    ) -> SmsResult<Vec<PduPart>>;

    fn decode_deliver(&self, hex: &str) -> SmsResult<DecodedPdu>;
}
