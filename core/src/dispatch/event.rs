use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;
use crate::state::ConversationIdentity;
use crate::value::Val;

/// One normalized inbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub identity: ConversationIdentity,
    pub payload: Payload,
}

impl InboundEvent {
    pub fn text(identity: ConversationIdentity, text: impl Into<String>) -> Self {
        Self {
            identity,
            payload: Payload::Text(text.into()),
        }
    }

    pub fn data(identity: ConversationIdentity, data: Val) -> Self {
        Self {
            identity,
            payload: Payload::Data(data),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Payload {
    Text(String),
    /// Structured input, e.g. a recognized intent or a card submission
    Data(Val),
    /// Delivered to the active wait as a failure
    Error(ErrorInfo),
    /// Cancel into the innermost frame of `target`, or end the conversation
    Interrupt { target: Option<String> },
}

/// Where the conversation stands after a turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Waiting for the next input
    Suspended { depth: usize },
    /// The root dialog returned this value
    Completed(Val),
    /// Canceled, or nothing was running
    Ended,
}
