//! Error types for IPAACA

use thiserror::Error;

/// Core IPAACA errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IpaacaError {
    // State machine errors
    #[error("IU {0} has already been committed")]
    Committed(String),

    #[error("IU {0} has already been retracted")]
    Retracted(String),

    #[error("IU {0} is read-only")]
    ReadOnly(String),

    #[error("Remote update of IU {0} failed")]
    UpdateFailed(String),

    // Ownership / identity errors
    #[error("IU {0} is already associated with a buffer")]
    AlreadyInABuffer(String),

    #[error("IU already has a uid: {0}")]
    AlreadyHasUid(String),

    #[error("IU already has an owner name: {0}")]
    AlreadyHasOwnerName(String),

    #[error("IU not found: {0}")]
    NotFound(String),

    #[error("IU {0} has not been published")]
    Unpublished(String),

    // Payload errors
    #[error("Payload type conversion failed: {0}")]
    TypeConversion(String),

    #[error("Payload addressing error: {0}")]
    Addressing(String),

    #[error("Malformed JSON in payload: {0}")]
    JsonParsing(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unknown record kind: {0:#04x}")]
    UnknownRecordKind(u8),

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("RPC {method} on {endpoint} timed out")]
    RpcTimeout { endpoint: String, method: String },

    #[error("No such endpoint: {0}")]
    NoSuchEndpoint(String),

    #[error("Incompatible protocol version {remote_major}.{remote_minor} (local {local_major}.{local_minor})")]
    IncompatibleProtocol {
        local_major: u32,
        local_minor: u32,
        remote_major: u32,
        remote_minor: u32,
    },
}

impl IpaacaError {
    /// True for the latch and permission errors raised by the unit state machine
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            IpaacaError::Committed(_) | IpaacaError::Retracted(_) | IpaacaError::ReadOnly(_)
        )
    }

    /// True for errors produced while decoding inbound bytes
    pub fn is_wire_error(&self) -> bool {
        matches!(
            self,
            IpaacaError::InvalidWireFormat(_)
                | IpaacaError::BufferTooShort { .. }
                | IpaacaError::UnknownRecordKind(_)
                | IpaacaError::JsonParsing(_)
        )
    }
}

/// Result type for IPAACA operations
pub type IpaacaResult<T> = Result<T, IpaacaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(IpaacaError::Committed("u".into()).is_state_violation());
        assert!(IpaacaError::ReadOnly("u".into()).is_state_violation());
        assert!(!IpaacaError::UpdateFailed("u".into()).is_state_violation());

        assert!(IpaacaError::JsonParsing("eof".into()).is_wire_error());
        assert!(IpaacaError::BufferTooShort { expected: 4, actual: 1 }.is_wire_error());
        assert!(!IpaacaError::NotFound("u".into()).is_wire_error());
    }

    #[test]
    fn test_error_display() {
        let err = IpaacaError::UnknownRecordKind(0x7f);
        assert_eq!(err.to_string(), "Unknown record kind: 0x7f");
    }
}
