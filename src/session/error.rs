use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{FrontendMessage, ProtocolError};

/// Terminal failure of a scripted session.
///
/// The first error ends the session; there are no retries.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client sent a frame that does not match the expected step.
    #[error("step {step}: expected {expected}, got {actual}")]
    Mismatch {
        step: usize,
        expected: Box<FrontendMessage>,
        actual: Box<FrontendMessage>,
    },
    /// The client closed the connection while a step still expected a frame.
    #[error("step {step}: connection closed while expecting {expected}")]
    UnexpectedEof {
        step: usize,
        expected: Box<FrontendMessage>,
    },
    /// The client sent bytes that are not a valid frame.
    #[error("protocol error: {0}")]
    Decode(#[source] ProtocolError),
    /// No client connected within the accept timeout.
    #[error("no client connected within {0:?}")]
    NoClient(Duration),
    /// The client stopped talking before the script finished.
    #[error("session timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// The client sent more than the script consumed.
    #[error("{0} unread bytes left after the script finished")]
    TrailingData(usize),
    /// The background task panicked or was cancelled.
    #[error("session task aborted: {0}")]
    Aborted(String),
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(e) => SessionError::Transport(e),
            e => SessionError::Decode(e),
        }
    }
}
