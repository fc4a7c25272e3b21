//! Core error types
//!
//! Invalid transitions are programming/protocol errors: the caller asked
//! for a move the adjacency table does not allow. Precondition violations
//! are timing/ordering issues (e.g. cleanup while a workspace is still in
//! use) and are kept distinct so callers can retry them.

use std::fmt;

/// Error raised by state-machine operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The target state is not adjacent to the current state
    InvalidTransition {
        from: String,
        to: String,
        from_terminal: bool,
    },
    /// The transition is topologically valid but a runtime precondition
    /// does not hold yet
    Precondition(String),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::InvalidTransition {
                from,
                to,
                from_terminal,
            } => {
                if *from_terminal {
                    write!(f, "invalid transition from terminal state {} to {}", from, to)
                } else {
                    write!(f, "invalid transition from {} to {}", from, to)
                }
            }
            StateError::Precondition(msg) => write!(f, "precondition violated: {}", msg),
        }
    }
}

impl std::error::Error for StateError {}

/// Error raised when parsing an execution key fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyError(pub String);

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed execution key: {}", self.0)
    }
}

impl std::error::Error for KeyError {}

/// Error raised when an inbound wire message fails validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Message could not be decoded, or its type is unknown
    Malformed(String),
    /// Message decoded but a required field is missing or empty
    MissingField {
        message_type: &'static str,
        field: &'static str,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(msg) => write!(f, "malformed message: {}", msg),
            ProtocolError::MissingField {
                message_type,
                field,
            } => write!(f, "{} message missing required field '{}'", message_type, field),
        }
    }
}

impl std::error::Error for ProtocolError {}
