//! Control flow state and run results

use serde::{Deserialize, Serialize};

use super::frame::Frame;
use crate::error::ErrorInfo;
use crate::value::Val;

/* ===================== Control Flow ===================== */

/// What is delivered to a Wait: a value or an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Outcome {
    Value(Val),
    Error(ErrorInfo),
}

impl Outcome {
    /// Convert to a `Result`, so a catching step can rethrow with `?`
    pub fn into_result(self) -> Result<Val, ErrorInfo> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Error(e) => Err(e),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }
}

/// Pending control transfer inside a run
///
/// When control != None the fiber has work to do before it can suspend.
/// Only `Control::None` is a valid checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Control {
    #[default]
    None,
    /// Active frame was just pushed; run its entry step with these arguments
    Start(Val),
    /// Deliver to the active frame's wait (or finish, if the stack is empty)
    Resume(Outcome),
}

/* ===================== States ===================== */

/// Observable fiber state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Transfers pending; only seen during a run
    Idle,
    /// A wait is pending and no input is queued; the only checkpointable state
    Suspended,
    /// Stack is empty
    Terminated,
}

/// How a run ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Suspended,
    /// Root dialog completed with this value
    Completed(Val),
}

/// Where a cancellation stops unwinding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTarget {
    /// Drop every frame; the conversation ends
    All,
    /// Keep this many frames and cancel into the top one
    Depth(usize),
    /// Cancel into the innermost frame running this dialog
    Dialog(String),
}

/* ===================== Persisted Form ===================== */

pub const STACK_FORMAT_VERSION: u32 = 1;

/// Checkpoint of a suspended fiber
///
/// Every frame carries exactly one wait: the top frame's is the pending
/// input wait, the others are return continuations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStack {
    pub version: u32,
    pub frames: Vec<Frame>,
}

impl PersistedStack {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn active_dialog(&self) -> Option<&str> {
        self.frames.last().map(|f| f.dialog.as_str())
    }
}
