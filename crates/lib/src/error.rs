//! Error taxonomy shared by the command and event channels.

use crate::protocol::ErrorDescriptor;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the gateway client and the event listener.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Endpoint unreachable, or a send/receive on an established link failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The command channel returned a structurally invalid reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No matching response arrived within the deadline.
    #[error("timed out after {0:?} waiting for a response")]
    Timeout(Duration),

    /// A payload on either channel was not a well-formed envelope.
    #[error("decode error: {0}")]
    Decode(String),

    /// A transaction id was registered while still pending from an earlier
    /// request. Ids are generated from a monotonic counter, so this only
    /// fires on an internal invariant violation.
    #[error("transaction {0} is already pending")]
    DuplicateTransaction(String),

    /// The gateway answered with an error response.
    #[error("gateway rejected the request: {} (code {})", .0.reason, .0.code)]
    Rejected(ErrorDescriptor),
}
