//! Error types for the RDMA engine.

use thiserror::Error;

/// Coarse classification of an [`RdmaError`], convenient for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Null, malformed or out-of-range input.
    InvalidArgument,
    /// Operation invoked outside its required lifecycle or connection state.
    BadState,
    /// A task pool, queue or the connection table is full.
    ResourceExhausted,
    /// The bound device or transport does not support the request.
    NotSupported,
    /// Handshake failed, timed out, or peer details were corrupted.
    ConnectionAborted,
    /// The underlying transport call failed.
    DriverFailure,
    /// Internal invariant violation.
    Unexpected,
}

/// Errors returned by the engine, either synchronously or inside a completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RdmaError {
    /// Input rejected before any work was queued.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Call made in the wrong context, task or connection state.
    #[error("{operation} not allowed in state {state}")]
    BadState { operation: &'static str, state: String },

    /// A bounded pool, queue or table is full.
    #[error("{resource} exhausted (capacity {capacity})")]
    ResourceExhausted { resource: &'static str, capacity: usize },

    /// Unsupported by the device or the configured transport.
    #[error("not supported: {reason}")]
    NotSupported { reason: String },

    /// Handshake failure, peer disconnect, or stop while in flight.
    #[error("connection aborted: {reason}")]
    ConnectionAborted { reason: String },

    /// Transport-level failure, including remote access errors.
    #[error("driver failure: {reason}")]
    DriverFailure { reason: String },

    /// Internal bookkeeping went wrong.
    #[error("unexpected: {reason}")]
    Unexpected { reason: String },
}

impl RdmaError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RdmaError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            RdmaError::BadState { .. } => ErrorKind::BadState,
            RdmaError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            RdmaError::NotSupported { .. } => ErrorKind::NotSupported,
            RdmaError::ConnectionAborted { .. } => ErrorKind::ConnectionAborted,
            RdmaError::DriverFailure { .. } => ErrorKind::DriverFailure,
            RdmaError::Unexpected { .. } => ErrorKind::Unexpected,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        RdmaError::InvalidArgument { reason: reason.into() }
    }

    pub(crate) fn bad_state(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        RdmaError::BadState {
            operation,
            state: format!("{:?}", state),
        }
    }

    pub(crate) fn not_supported(reason: impl Into<String>) -> Self {
        RdmaError::NotSupported { reason: reason.into() }
    }

    pub(crate) fn aborted(reason: impl Into<String>) -> Self {
        RdmaError::ConnectionAborted { reason: reason.into() }
    }

    pub(crate) fn driver(reason: impl Into<String>) -> Self {
        RdmaError::DriverFailure { reason: reason.into() }
    }

    pub(crate) fn unexpected(reason: impl Into<String>) -> Self {
        RdmaError::Unexpected { reason: reason.into() }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RdmaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(RdmaError::invalid("x").kind(), ErrorKind::InvalidArgument);
        assert_eq!(RdmaError::bad_state("start", "Running").kind(), ErrorKind::BadState);
        assert_eq!(
            RdmaError::ResourceExhausted { resource: "send task pool", capacity: 4 }.kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(RdmaError::not_supported("dc").kind(), ErrorKind::NotSupported);
        assert_eq!(RdmaError::aborted("timeout").kind(), ErrorKind::ConnectionAborted);
        assert_eq!(RdmaError::driver("gone").kind(), ErrorKind::DriverFailure);
        assert_eq!(RdmaError::unexpected("bug").kind(), ErrorKind::Unexpected);
    }

    #[test]
    fn test_display_messages() {
        let err = RdmaError::bad_state("set_mtu", "Running");
        assert_eq!(err.to_string(), "set_mtu not allowed in state \"Running\"");

        let err = RdmaError::ResourceExhausted { resource: "connection table", capacity: 2 };
        assert_eq!(err.to_string(), "connection table exhausted (capacity 2)");
    }
}
