// ABOUTME: Error types shared by every transport, the router and the dispatch service
// ABOUTME: Maps transport failures onto message failure causes and connection state decisions

use crate::message::FailureCause;
use crate::smpp::CommandStatus;
use std::io;
use thiserror::Error;

/// Error type for gateway and service operations
///
/// Protocol drivers raise these and the owning gateway decides whether the
/// failure is fatal for the connection (see [`SmsError::is_link_failure`]).
#[derive(Debug, Error)]
pub enum SmsError {
    /// I/O error on the underlying channel (socket, serial line)
    #[error("Connection error: {0}")]
    Io(#[from] io::Error),

    /// A command/response exchange exceeded its wait budget
    #[error("Operation timeout")]
    Timeout,

    /// The transport rejected the operation; carries the raw response
    #[error("Gateway rejected operation: {response}")]
    Rejected { response: String },

    /// SMPP response carrying a non-zero command_status
    #[error("SMPP error: {0:?}")]
    Smpp(CommandStatus),

    /// HTTP transport failure (connect, TLS, request building)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Data validation error (bad recipient, undecodable listing, ...)
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Connection closed by the peer
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The transport does not implement this operation
    #[error("Feature not supported by {0} gateway")]
    NotSupported(&'static str),

    /// Payload encryption or decryption failed
    #[error("Encryption error: {0}")]
    Crypto(String),

    /// Configuration could not be parsed or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for gateway and service operations
pub type SmsResult<T> = Result<T, SmsError>;

impl SmsError {
    /// Build a rejection from a raw transport response
    pub fn rejected(response: impl Into<String>) -> Self {
        SmsError::Rejected {
            response: response.into(),
        }
    }

    /// True when the channel itself is unusable and the owning connection
    /// has to leave the `Started` state.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            SmsError::Io(_) | SmsError::Timeout | SmsError::ConnectionClosed
        )
    }

    /// Failure cause recorded on an outbound message that failed with this error
    pub fn failure_cause(&self) -> FailureCause {
        match self {
            SmsError::Io(_) | SmsError::Timeout | SmsError::ConnectionClosed => {
                FailureCause::GatewayFailure
            }
            SmsError::Http(_) | SmsError::Rejected { .. } => FailureCause::GatewayFailure,
            SmsError::Smpp(status) => match status {
                CommandStatus::InvalidPassword
                | CommandStatus::InvalidSystemId
                | CommandStatus::BindFailed => FailureCause::AuthFailure,
                CommandStatus::InvalidDestinationAddress => FailureCause::BadRecipient,
                CommandStatus::InvalidMsgLength | CommandStatus::InvalidSourceAddress => {
                    FailureCause::BadFormat
                }
                _ => FailureCause::GatewayFailure,
            },
            SmsError::InvalidData(_) | SmsError::Crypto(_) => FailureCause::BadFormat,
            SmsError::NotSupported(_)
            | SmsError::InvalidState(_)
            | SmsError::Config(_) => FailureCause::Unknown,
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for SmsError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            SmsError::Io(io::Error::new(io_err.kind(), err.to_string()))
        } else {
            SmsError::InvalidData(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_failures_are_channel_level_only() {
        assert!(SmsError::Timeout.is_link_failure());
        assert!(SmsError::ConnectionClosed.is_link_failure());
        assert!(SmsError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_link_failure());
        assert!(!SmsError::rejected("+CMS ERROR: 500").is_link_failure());
        assert!(!SmsError::Smpp(CommandStatus::SystemError).is_link_failure());
    }

    #[test]
    fn smpp_status_maps_to_failure_cause() {
        assert_eq!(
            SmsError::Smpp(CommandStatus::InvalidPassword).failure_cause(),
            FailureCause::AuthFailure
        );
        assert_eq!(
            SmsError::Smpp(CommandStatus::InvalidDestinationAddress).failure_cause(),
            FailureCause::BadRecipient
        );
        assert_eq!(
            SmsError::Smpp(CommandStatus::Throttled).failure_cause(),
            FailureCause::GatewayFailure
        );
    }

    #[test]
    fn boxed_io_errors_keep_their_kind() {
        let boxed: Box<dyn std::error::Error + Send + Sync> =
            Box::new(io::Error::from(io::ErrorKind::ConnectionReset));
        match SmsError::from(boxed) {
            SmsError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected {other:?}"),
        }
    }
}
