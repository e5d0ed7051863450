//! Error taxonomy for the convergence layer.
//!
//! Every fallible operation in the wire codec, stage state machine, transfer
//! manager, and session layers returns [`CoreError`]. The variants mirror the
//! fault categories a TCPCLv4 implementation has to distinguish: malformed
//! frames are not the same as a peer-initiated refusal, and neither is the
//! same as a voluntary shutdown. Callers that need to decide whether to
//! retry (`Session::start`, the CLA Manager's supervisor) match on
//! [`CoreError::is_retryable`] rather than re-deriving that policy at each
//! call site.

use std::io;

use thiserror::Error;

/// The closed set of faults the convergence layer can raise.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The underlying byte stream failed. Always session-fatal.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The first five bytes of a stream were not the TCPCLv4 magic.
    #[error("bad contact header magic")]
    BadMagic,

    /// A frame could not be decoded (truncated, invalid flag bits, etc).
    #[error("decode error: {0}")]
    Decode(String),

    /// The leading octet of a frame did not match any known message type.
    #[error("unknown message type {0:#x}")]
    UnknownMessageType(u8),

    /// A well-formed message arrived at a point the protocol forbids.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// SESS_INIT parameters were unacceptable (e.g. a zero MTU).
    #[error("negotiation failure: {0}")]
    Negotiation(String),

    /// No message was received within the negotiated keepalive interval.
    #[error("session stalled: no data received within keepalive interval")]
    Stalled,

    /// The peer returned XFER_REFUSE for an outgoing transfer.
    #[error("transfer refused by peer: {0:?}")]
    TransferRefused(crate::wire::RefusalReasonCode),

    /// A stage or the switch was closed deliberately; not a real failure.
    #[error("stage closed")]
    StageClose,

    /// The owning manager or session was stopped while an operation was
    /// in flight.
    #[error("manager stopped")]
    ManagerStopped,

    /// A transient failure while establishing the transport (connection
    /// refused, DNS failure, timeout). `retry` tells the caller whether
    /// retrying makes sense.
    #[error("transient failure (retry={retry}): {message}")]
    Transient { message: String, retry: bool },

    /// The stage handshake did not reach Established before the configured
    /// timeout elapsed.
    #[error("stage timed out")]
    Timeout,

    /// The CLA Manager refused a `register` call: the address already has
    /// an active element, or accepting it would create a self-loop.
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),
}

impl CoreError {
    /// Construct a transient, retryable error from a lower-level cause.
    pub fn transient(message: impl Into<String>) -> Self {
        CoreError::Transient {
            message: message.into(),
            retry: true,
        }
    }

    /// Construct a transient, non-retryable error (e.g. a config error
    /// that retrying will never fix).
    pub fn transient_fatal(message: impl Into<String>) -> Self {
        CoreError::Transient {
            message: message.into(),
            retry: false,
        }
    }

    /// Whether a caller driving `Session::start` should retry after this
    /// error. Matches spec.md §7's propagation policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout | CoreError::Transient { retry: true, .. }
        )
    }

    /// Whether this error should never be surfaced to the host as a fault
    /// (voluntary shutdown paths).
    pub fn is_voluntary(&self) -> bool {
        matches!(self, CoreError::StageClose | CoreError::ManagerStopped)
    }
}

impl From<tokio::time::error::Elapsed> for CoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CoreError::Timeout
    }
}
