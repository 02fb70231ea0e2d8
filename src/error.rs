//! Error types for pacerpc.

use thiserror::Error;

/// Reason a peer refused a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    /// The peer's session table is full.
    ResourceExhausted = 1,
    /// The peer speaks an incompatible wire format.
    VersionMismatch = 2,
    /// The peer has no handler registered for the requested type.
    UnknownHandler = 3,
}

impl RejectReason {
    pub(crate) fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(RejectReason::ResourceExhausted),
            2 => Some(RejectReason::VersionMismatch),
            3 => Some(RejectReason::UnknownHandler),
            _ => None,
        }
    }
}

/// Error type for pacerpc operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Buffer or table allocation failed.
    #[error("allocation failed: {0}")]
    NoMem(&'static str),

    /// All request slots in the session window are occupied.
    #[error("request window full")]
    NoSlot,

    /// The operation is forbidden in the session's current state.
    #[error("session {session_num} is {state}")]
    SessionState { session_num: u16, state: &'static str },

    /// The session has been torn down.
    #[error("session {0} is disconnected")]
    SessionDisconnected(u16),

    /// The handshake received no reply within the cap.
    #[error("session management timeout for session {0}")]
    SmTimeout(u16),

    /// The peer refused the connect request.
    #[error("peer rejected session: {0:?}")]
    SmRejected(RejectReason),

    /// The packet's deadline lies beyond the wheel's coverage.
    #[error("deadline {deadline_tsc} exceeds wheel horizon {horizon_tsc}")]
    WheelHorizon { deadline_tsc: u64, horizon_tsc: u64 },

    /// A handler is already registered for this request type.
    #[error("handler already registered for request type {0}")]
    HandlerExists(u8),

    /// The remote hostname could not be resolved.
    #[error("cannot resolve {0}")]
    Resolve(String),

    /// Message exceeds the maximum supported size.
    #[error("message too large: {size} bytes, max {max} bytes")]
    MsgTooLarge { size: usize, max: usize },

    /// IO error from the SM socket or the transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pacerpc operations.
pub type Result<T> = std::result::Result<T, Error>;
