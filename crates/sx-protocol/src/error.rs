//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding request payloads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is too short for the record it must contain
    #[error("Malformed payload: expected at least {needed} bytes, got {actual}")]
    MalformedPayload { needed: usize, actual: usize },
}
