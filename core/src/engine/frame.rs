//! Frames, waits and the dialog stack

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ProtocolViolation;
use crate::value::ValType;

/* ===================== Wait ===================== */

/// A durable suspension point
///
/// `step` names the continuation to run when the wait is satisfied; it is
/// resolved against the frame's dialog at resume time, so nothing executable
/// is ever serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wait {
    pub expected: ValType,
    pub step: String,
    /// Whether the continuation handles errors. When false, an error
    /// delivered to this wait pops the frame and moves on to the parent.
    #[serde(default)]
    pub catch: bool,
}

impl Wait {
    pub fn new(expected: ValType, step: impl Into<String>) -> Self {
        Self {
            expected,
            step: step.into(),
            catch: false,
        }
    }

    pub fn catching(expected: ValType, step: impl Into<String>) -> Self {
        Self {
            expected,
            step: step.into(),
            catch: true,
        }
    }
}

/* ===================== Frame ===================== */

/// Activation record for one dialog invocation
///
/// A frame whose `wait` is `None` is mid-execution. That only happens
/// transiently inside a run and is never checkpointed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Registry id of the dialog behavior
    pub dialog: String,

    /// Dialog-private local state
    #[serde(default)]
    pub state: JsonValue,

    #[serde(default)]
    pub wait: Option<Wait>,
}

impl Frame {
    pub fn new(dialog: impl Into<String>) -> Self {
        Self {
            dialog: dialog.into(),
            state: JsonValue::Null,
            wait: None,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.wait.is_some()
    }
}

/* ===================== Stack ===================== */

/// Ordered frames, root first, active frame last
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stack {
    frames: Vec<Frame>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// Push a frame and make it the active one
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Remove the active frame
    pub fn pop(&mut self) -> Result<Frame, ProtocolViolation> {
        self.frames
            .pop()
            .ok_or(ProtocolViolation::EmptyStack { op: "pop" })
    }

    /// The active frame
    pub fn peek(&self) -> Result<&Frame, ProtocolViolation> {
        self.frames
            .last()
            .ok_or(ProtocolViolation::EmptyStack { op: "peek" })
    }

    pub fn peek_mut(&mut self) -> Result<&mut Frame, ProtocolViolation> {
        self.frames
            .last_mut()
            .ok_or(ProtocolViolation::EmptyStack { op: "peek" })
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    /// Index of the innermost frame running `dialog`
    pub fn position_of(&self, dialog: &str) -> Option<usize> {
        self.frames.iter().rposition(|f| f.dialog == dialog)
    }

    /// Pop everything above `depth` frames
    pub fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
