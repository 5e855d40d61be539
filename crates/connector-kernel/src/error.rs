//! Connector error types.
//!
//! Every public API in this crate reports failures through
//! [`ConnectorError`].  Registration and send errors reach the caller
//! directly; inbound delivery errors are absorbed at the router boundary by
//! [`Connector::input`](crate::connector::Connector::input), which logs and
//! discards the frame.

use crate::message::CbId;

/// Unified error type for the connector.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    // -- Inbound ------------------------------------------------------------
    /// The sender does not hold administrative privilege.
    #[error("permission denied: sender pid {pid} is not privileged")]
    PermissionDenied { pid: u32 },

    /// No callback is registered for the identifier.
    #[error("no destination for {id}")]
    NoDestination { id: CbId },

    /// The frame is too short or its length fields disagree.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// The frame exceeds the configured maximum message size.
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// A control message failed length validation.  Never reaches the
    /// sender; the control handler drops the message.
    #[error("malformed control message: {reason}")]
    MalformedControlMessage { reason: String },

    // -- Registration -------------------------------------------------------
    /// A callback with the same identifier is already registered.
    #[error("callback {id} is already registered")]
    DuplicateIdentifier { id: CbId },

    // -- Resources ----------------------------------------------------------
    /// An allocation could not be satisfied.
    #[error("out of memory: {what}")]
    OutOfMemory { what: &'static str },

    /// The serial dispatch queue refused the unit.
    #[error("dispatch queue `{queue}` rejected work")]
    DispatchSubmitFailure { queue: String },

    /// The serial dispatch queue could not be created.
    #[error("failed to create dispatch queue `{queue}`: {reason}")]
    QueueCreation { queue: String, reason: String },

    /// The connector has been shut down.
    #[error("connector is shut down")]
    ShutDown,
}

impl ConnectorError {
    /// Negative errno equivalent, for transports that report status codes.
    pub fn errno(&self) -> i32 {
        match self {
            Self::PermissionDenied { .. } => -1,  // EPERM
            Self::NoDestination { .. } => -19,    // ENODEV
            Self::OutOfMemory { .. } => -12,      // ENOMEM
            Self::FrameTooLarge { .. } => -90,    // EMSGSIZE
            Self::QueueCreation { .. } | Self::ShutDown => -5, // EIO
            Self::MalformedFrame { .. }
            | Self::MalformedControlMessage { .. }
            | Self::DuplicateIdentifier { .. }
            | Self::DispatchSubmitFailure { .. } => -22, // EINVAL
        }
    }
}

/// Convenience alias used throughout the connector crate.
pub type Result<T> = std::result::Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let id = CbId::new(1, 100);
        assert_eq!(ConnectorError::PermissionDenied { pid: 7 }.errno(), -1);
        assert_eq!(ConnectorError::NoDestination { id }.errno(), -19);
        assert_eq!(ConnectorError::DuplicateIdentifier { id }.errno(), -22);
        assert_eq!(ConnectorError::OutOfMemory { what: "frame" }.errno(), -12);
    }

    #[test]
    fn display_includes_identifier() {
        let err = ConnectorError::DuplicateIdentifier {
            id: CbId::new(1, 100),
        };
        assert_eq!(err.to_string(), "callback {1:100} is already registered");
    }
}
