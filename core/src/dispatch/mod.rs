// Per-turn driver
//
// This module connects the engine to its collaborators:
// - Loading the three state partitions for an identity
// - Choosing between starting the root dialog and resuming a stack
// - Routing global interrupts before input reaches the active wait
// - Saving state conditioned on the loaded ETags, then flushing messages

mod dispatcher;
mod event;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::error::{ErrorInfo, ProtocolViolation};
use crate::state::StateKey;
use crate::store::StoreError;

// Re-export public API
pub use dispatcher::{ConversationSnapshot, DispatchConfig, Dispatcher, IncompatibleStatePolicy};
pub use event::{InboundEvent, Payload, TurnOutcome};

/// Why a turn did not complete normally
///
/// Each variant is a distinct kind so the transport can choose between
/// apologizing to the user, retrying delivery, and alerting an operator.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The engine was driven incorrectly. Nothing was saved or sent.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// A dialog error reached the root. The ended conversation was saved
    /// and queued messages were sent.
    #[error("unhandled dialog error: {0}")]
    Unhandled(ErrorInfo),

    /// Another turn for this identity saved first. Nothing was saved or sent.
    #[error("concurrent turn detected on {key}")]
    Conflict { key: StateKey },

    #[error("storage failure: {0}")]
    Storage(#[source] StoreError),

    #[error("corrupt state in {key}: {source}")]
    CorruptState {
        key: StateKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("persisted stack cannot be resumed: {reason}")]
    IncompatibleState { reason: String },

    /// State was saved but the transport rejected the messages
    #[error("message delivery failed: {0:#}")]
    Delivery(#[source] anyhow::Error),
}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { key } => DispatchError::Conflict { key },
            other => DispatchError::Storage(other),
        }
    }
}
