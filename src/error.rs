//! Custom error types for the drive system.
//!
//! `DriveError` is the single error enum for the crate, built with `thiserror`.
//! Validation and parsing failures are raised at the caller boundary before any
//! bytes reach the serial line; link timeouts and malformed replies are
//! recovered locally by callers that can retry; motion aborts carry their
//! controller-reported subclass so coordinated operations can react to stalls
//! and tracking errors differently.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DriveResult<T> = std::result::Result<T, DriveError>;

/// Subclass of a controller-reported abort status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    /// `! STALL ABORT`: the motor stalled against an obstruction.
    Stall,
    /// `! TRACKING ABORT`: the encoder fell too far behind the commanded profile.
    Tracking,
    /// `! ENCODER ABORT`: the encoder readback failed.
    Encoder,
    /// `! COMMAND ABORT`: an explicit abort command latched the axis.
    Command,
    /// Any other status containing `ABORT`.
    Unknown,
}

impl std::fmt::Display for AbortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AbortKind::Stall => "stall",
            AbortKind::Tracking => "tracking",
            AbortKind::Encoder => "encoder",
            AbortKind::Command => "command",
            AbortKind::Unknown => "unknown",
        };
        write!(f, "{text}")
    }
}

/// Why a command was rejected before transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The text could not be deconstructed into (axis, verb, arg).
    Undecodable,
    /// The axis number is outside 1..=N.
    AxisOutOfRange,
    /// The axis is disabled and the verb is not in the always-permitted set.
    AxisDisabled,
    /// The axis is paused by the duty-cycle governor and the verb causes movement.
    AxisPaused,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejectReason::Undecodable => "undecodable",
            RejectReason::AxisOutOfRange => "axis-out-of-range",
            RejectReason::AxisDisabled => "axis-disabled",
            RejectReason::AxisPaused => "axis-paused",
        };
        write!(f, "{text}")
    }
}

/// Anything that can go wrong between a caller and the motor box.
#[derive(Error, Debug)]
pub enum DriveError {
    /// Missing required option, unparseable value, or a bad static table.
    #[error("configuration error: {0}")]
    Config(String),

    /// The serial port cannot be opened, is owned elsewhere, or closed
    /// mid-operation.
    #[error("serial link unavailable: {0}")]
    LinkUnavailable(String),

    /// The read deadline expired with no reply at all.
    #[error("no reply from controller within the read deadline")]
    LinkTimeout,

    /// A reply arrived but matches no known pattern.
    #[error("malformed reply from controller: {0:?}")]
    ProtocolMalformed(String),

    /// A command was refused locally, before any bytes were written.
    #[error("command {command:?} rejected ({reason})")]
    CommandRejected {
        /// The offending command, in wire form.
        command: String,
        /// Why it was refused.
        reason: RejectReason,
    },

    /// The controller reported a non-benign abort status.
    #[error("motion aborted on axis {axis} ({kind})")]
    MotionAborted {
        /// The aborted axis.
        axis: u8,
        /// The reported abort subclass.
        kind: AbortKind,
    },

    /// A coordinated operation observed its cancel flag.
    #[error("operation cancelled")]
    Cancelled,

    /// A coordinated operation failed; the text carries the context.
    #[error("operation failed: {0}")]
    Operation(String),

    /// A recovery loop (stall or tracking) hit its configured limit.
    #[error("recovery limit reached: {0}")]
    ResourceExhausted(String),

    /// An underlying I/O failure outside the patterns above.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriveError {
    /// True for the two locally-recoverable reply failures, where callers may
    /// retry a bounded number of times instead of propagating.
    pub fn is_no_response(&self) -> bool {
        matches!(
            self,
            DriveError::LinkTimeout | DriveError::ProtocolMalformed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriveError::MotionAborted {
            axis: 3,
            kind: AbortKind::Stall,
        };
        assert_eq!(err.to_string(), "motion aborted on axis 3 (stall)");
    }

    #[test]
    fn test_reject_reason_display() {
        let err = DriveError::CommandRejected {
            command: "4mr100\r".to_string(),
            reason: RejectReason::AxisDisabled,
        };
        assert!(err.to_string().contains("axis-disabled"));
    }

    #[test]
    fn test_no_response_classification() {
        assert!(DriveError::LinkTimeout.is_no_response());
        assert!(DriveError::ProtocolMalformed("junk".into()).is_no_response());
        assert!(!DriveError::Cancelled.is_no_response());
    }
}
