//! Outbound messages and the transport boundary
//!
//! Steps queue messages on the turn's `Outbox`. The dispatcher hands them to
//! a `MessageSink` only after state was saved, in the order they were queued.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::state::ConversationIdentity;
use crate::value::Val;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub id: Uuid,
    #[serde(default)]
    pub text: Option<String>,
    /// Structured attachment (cards, suggested actions) for the transport
    #[serde(default)]
    pub data: Option<Val>,
    pub timestamp: DateTime<Utc>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: Some(text.into()),
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn data(data: Val) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: None,
            data: Some(data),
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Val) -> Self {
        self.data = Some(data);
        self
    }
}

/// Messages queued during one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outbox {
    messages: Vec<OutgoingMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: OutgoingMessage) {
        self.messages.push(message);
    }

    /// Take every queued message, leaving the outbox empty
    pub fn drain(&mut self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut self.messages)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutgoingMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/* ===================== Sinks ===================== */

/// Transport side of the outbound boundary
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Deliver one turn's messages, preserving order
    async fn deliver(
        &self,
        identity: &ConversationIdentity,
        messages: &[OutgoingMessage],
    ) -> anyhow::Result<()>;
}

/// Keeps everything it is given; used by tests
#[derive(Debug, Default)]
pub struct CollectingSink {
    delivered: Mutex<Vec<(ConversationIdentity, OutgoingMessage)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text of every delivered message, in delivery order
    pub async fn texts(&self) -> Vec<String> {
        self.delivered
            .lock()
            .await
            .iter()
            .filter_map(|(_, m)| m.text.clone())
            .collect()
    }

    pub async fn take(&self) -> Vec<(ConversationIdentity, OutgoingMessage)> {
        std::mem::take(&mut *self.delivered.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.delivered.lock().await.len()
    }
}

#[async_trait]
impl MessageSink for CollectingSink {
    async fn deliver(
        &self,
        identity: &ConversationIdentity,
        messages: &[OutgoingMessage],
    ) -> anyhow::Result<()> {
        let mut delivered = self.delivered.lock().await;
        delivered.extend(messages.iter().map(|m| (identity.clone(), m.clone())));
        Ok(())
    }
}

/// Prints messages for the console connector
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl MessageSink for StdoutSink {
    async fn deliver(
        &self,
        _identity: &ConversationIdentity,
        messages: &[OutgoingMessage],
    ) -> anyhow::Result<()> {
        for message in messages {
            if let Some(text) = &message.text {
                println!("bot> {text}");
            }
            if let Some(data) = &message.data {
                println!("bot> [data] {}", serde_json::to_string(data)?);
            }
        }
        Ok(())
    }
}
