//! Failure taxonomy
//!
//! Three kinds of failure leave the engine, and callers must be able to tell
//! them apart:
//! - `ProtocolViolation`: the engine was driven incorrectly (wrong input type,
//!   empty-stack access, a step that neither waited nor completed). Fatal to
//!   the run and never coerced.
//! - `ErrorInfo` raised by dialog code and not handled by any ancestor frame
//!   (`EngineError::Unhandled`).
//! - Storage failures, defined next to the store in `crate::store`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::value::ValType;

/* ===================== Error Codes ===================== */

/// Routed into an ancestor's Wait when frames above it are canceled
pub const CANCELED: &str = "CANCELED";
/// A prompt ran out of retries
pub const TOO_MANY_ATTEMPTS: &str = "TOO_MANY_ATTEMPTS";
/// Generic failure raised from dialog code
pub const DIALOG_ERROR: &str = "DIALOG_ERROR";
/// Delivered via an inbound error payload
pub const CHANNEL_ERROR: &str = "CHANNEL_ERROR";

/// Application error value
///
/// This is the "exception" of the dialog world: it is serializable so it can
/// ride the Fail path through frames and be persisted if a handler stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn dialog(message: impl Into<String>) -> Self {
        Self::new(DIALOG_ERROR, message)
    }

    pub fn canceled() -> Self {
        Self::new(CANCELED, "Operation canceled")
    }

    pub fn is_canceled(&self) -> bool {
        self.code == CANCELED
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Lets dialog steps use `?` on bag reads and writes
impl From<serde_json::Error> for ErrorInfo {
    fn from(e: serde_json::Error) -> Self {
        Self::dialog(format!("Serialization failed: {e}"))
    }
}

/* ===================== Protocol Violations ===================== */

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("{op} called on an empty dialog stack")]
    EmptyStack { op: &'static str },

    #[error("dialog '{dialog}' step '{step}' expects {expected}, got {actual}")]
    TypeMismatch {
        dialog: String,
        step: String,
        expected: ValType,
        actual: ValType,
    },

    #[error("dialog '{dialog}' is not suspended on a wait")]
    NotSuspended { dialog: String },

    #[error("root dialog pushed onto a stack of depth {depth}")]
    StackNotEmpty { depth: usize },

    #[error("dialog '{dialog}' step '{step}' finished without wait, call, done or fail")]
    NoResumeHandler { dialog: String, step: String },

    #[error("dialog '{dialog}' step '{step}' requested more than one transfer")]
    MultipleResumeHandlers { dialog: String, step: String },

    #[error("dialog '{0}' is not registered")]
    UnknownDialog(String),

    #[error("dialog '{dialog}' has no step '{step}'")]
    UnknownStep { dialog: String, step: String },

    #[error("run exceeded {0} steps without suspending")]
    StepLimitExceeded(usize),

    #[error("cannot checkpoint while control is pending")]
    NotCheckpointable,

    #[error("cancel target not found on stack: {0}")]
    CancelTargetNotFound(String),
}

/* ===================== Engine Errors ===================== */

/// Distinguishable failure kind for callers of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Application,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("unhandled dialog error: {0}")]
    Unhandled(ErrorInfo),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::Unhandled(_) => ErrorKind::Application,
        }
    }
}
