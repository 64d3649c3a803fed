//! Turn handling
//!
//! ## Function Organization
//! 1. `handle()` - one inbound event, end to end
//! 2. `load()` / `resumable_stack()` - read and vet persisted state
//! 3. `input_for()` - map the payload (and global interrupts) to engine input
//! 4. `save()` - conditional write of every touched partition

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::event::{InboundEvent, Payload, TurnOutcome};
use super::DispatchError;
use crate::engine::{
    run_turn, CancelTarget, DialogRegistry, EngineConfig, PersistedStack, RootDialog, TurnInput,
    TurnScope, STACK_FORMAT_VERSION,
};
use crate::error::EngineError;
use crate::message::{MessageSink, OutgoingMessage, Outbox};
use crate::routing::{Matcher, RouteTable};
use crate::state::{Bag, ConversationIdentity, Partition, PrivateRecord, StateKey};
use crate::store::{Precondition, StateStore, StoreError, Versioned, Write};
use crate::value::Val;

/* ===================== Configuration ===================== */

/// What to do with a stack this deployment cannot resume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncompatibleStatePolicy {
    /// Drop the stack and start the root dialog again
    #[default]
    Reset,
    /// Fail the turn with `DispatchError::IncompatibleState`
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Dialog started when an identity has no conversation in progress
    pub root_dialog: String,
    /// Conversations idle longer than this start over
    pub conversation_ttl_secs: Option<u64>,
    pub incompatible_state: IncompatibleStatePolicy,
    /// Text that ends the conversation from any depth
    pub cancel_phrases: Vec<String>,
    /// Sent after queued messages when a dialog error reaches the root
    pub unhandled_error_reply: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            root_dialog: "profile".to_string(),
            conversation_ttl_secs: None,
            incompatible_state: IncompatibleStatePolicy::Reset,
            cancel_phrases: vec!["cancel".to_string()],
            unhandled_error_reply: Some("Sorry, something went wrong.".to_string()),
        }
    }
}

/// Decoded state of one identity, for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSnapshot {
    pub user: Bag,
    pub conversation: Bag,
    pub private: Option<PrivateRecord>,
}

/* ===================== Dispatcher ===================== */

/// Loaded partitions with the versions they were read at
struct Loaded {
    keys: [StateKey; 3],
    user: Option<Versioned>,
    conversation: Option<Versioned>,
    private: Option<Versioned>,
    user_data: Bag,
    conversation_data: Bag,
    record: Option<PrivateRecord>,
}

pub struct Dispatcher<S: StateStore> {
    store: Arc<S>,
    sink: Arc<dyn MessageSink>,
    registry: DialogRegistry,
    fingerprint: String,
    config: DispatchConfig,
    engine: EngineConfig,
    root: RootDialog,
    /// Target `None` cancels everything
    interrupts: RouteTable<Option<String>>,
}

impl<S: StateStore> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        sink: Arc<dyn MessageSink>,
        registry: DialogRegistry,
        config: DispatchConfig,
    ) -> Self {
        let mut interrupts = RouteTable::new();
        for phrase in &config.cancel_phrases {
            interrupts.add(Matcher::Exact(phrase.clone()), None);
        }

        Self {
            store,
            sink,
            fingerprint: registry.fingerprint(),
            registry,
            root: RootDialog::new(config.root_dialog.clone()),
            config,
            engine: EngineConfig::default(),
            interrupts,
        }
    }

    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Arguments for the root dialog when a conversation opens without input
    pub fn with_root_args(mut self, args: Val) -> Self {
        self.root.args = args;
        self
    }

    /// Cancel into `target` (or end the conversation) when `matcher` fires
    ///
    /// Routes are checked after the configured cancel phrases.
    pub fn with_interrupt(mut self, matcher: Matcher, target: Option<String>) -> Self {
        self.interrupts.add(matcher, target);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &DialogRegistry {
        &self.registry
    }

    /// Run one turn for the event's identity
    ///
    /// Messages reach the sink only after state was saved. On a conflict,
    /// protocol violation or storage failure nothing is sent.
    pub async fn handle(&self, event: InboundEvent) -> Result<TurnOutcome, DispatchError> {
        let identity = event.identity;
        info!(
            channel_id = %identity.channel_id,
            conversation_id = %identity.conversation_id,
            user_id = %identity.user_id,
            "Handling inbound event"
        );

        let loaded = self.load(&identity).await?;
        let stack = self.resumable_stack(loaded.record.as_ref())?;
        let input = self.input_for(event.payload, stack.as_ref());

        let Loaded {
            keys,
            user,
            conversation,
            private,
            user_data,
            conversation_data,
            record,
        } = loaded;

        let mut scope = TurnScope {
            user_data,
            conversation_data,
            private_data: record.map(|r| r.data).unwrap_or_default(),
            outbox: Outbox::new(),
        };

        let (stack, result, messages) =
            match run_turn(&self.registry, &self.engine, &self.root, stack, input, &mut scope) {
                Ok(turn) => {
                    let outcome = match (&turn.checkpoint, turn.completed) {
                        (Some(checkpoint), _) => TurnOutcome::Suspended {
                            depth: checkpoint.depth(),
                        },
                        (None, Some(value)) => TurnOutcome::Completed(value),
                        (None, None) => TurnOutcome::Ended,
                    };
                    debug!(?outcome, "Turn finished");
                    (turn.checkpoint, Ok(outcome), turn.messages)
                }
                Err(EngineError::Unhandled(error)) if error.is_canceled() => {
                    debug!("Cancellation reached the root dialog");
                    (None, Ok(TurnOutcome::Ended), scope.outbox.drain())
                }
                Err(EngineError::Unhandled(error)) => {
                    warn!(code = %error.code, message = %error.message, "Unhandled dialog error ended the conversation");
                    let mut messages = scope.outbox.drain();
                    if let Some(reply) = &self.config.unhandled_error_reply {
                        messages.push(OutgoingMessage::text(reply.clone()));
                    }
                    (None, Err(DispatchError::Unhandled(error)), messages)
                }
                Err(EngineError::Protocol(violation)) => {
                    error!(%violation, "Protocol violation, discarding turn");
                    return Err(DispatchError::Protocol(violation));
                }
            };

        let record = PrivateRecord::new(stack, scope.private_data, self.fingerprint.clone());
        let mut writes = Vec::with_capacity(3);
        if scope.user_data.is_dirty() {
            writes.push(Write::new(
                keys[0].clone(),
                scope.user_data.to_json(),
                Precondition::from_loaded(user.as_ref()),
            ));
        }
        if scope.conversation_data.is_dirty() {
            writes.push(Write::new(
                keys[1].clone(),
                scope.conversation_data.to_json(),
                Precondition::from_loaded(conversation.as_ref()),
            ));
        }
        writes.push(Write::new(
            keys[2].clone(),
            serde_json::to_value(&record).map_err(StoreError::from)?,
            Precondition::from_loaded(private.as_ref()),
        ));

        self.save(writes).await?;

        if !messages.is_empty() {
            self.sink
                .deliver(&identity, &messages)
                .await
                .map_err(DispatchError::Delivery)?;
        }

        result
    }

    /// Load and decode all three partitions of `identity`
    pub async fn snapshot(
        &self,
        identity: &ConversationIdentity,
    ) -> Result<ConversationSnapshot, DispatchError> {
        let loaded = self.load(identity).await?;
        Ok(ConversationSnapshot {
            user: loaded.user_data,
            conversation: loaded.conversation_data,
            private: loaded.record,
        })
    }

    /// Forget the conversation in progress; bags are kept
    pub async fn reset(&self, identity: &ConversationIdentity) -> Result<bool, DispatchError> {
        let key = identity.key(Partition::PrivateConversation);
        let existed = self.store.delete(&key).await.map_err(DispatchError::Storage)?;
        info!(%key, existed, "Reset conversation");
        Ok(existed)
    }

    /* ===================== Load ===================== */

    async fn load(&self, identity: &ConversationIdentity) -> Result<Loaded, DispatchError> {
        let keys = identity.keys();
        // A failed load fails the turn rather than starting over
        let mut records = self
            .store
            .load(&keys)
            .await
            .map_err(DispatchError::Storage)?
            .into_iter();
        let user = records.next().flatten();
        let conversation = records.next().flatten();
        let private = records.next().flatten();

        let user_data = decode(&keys[0], user.as_ref())?.unwrap_or_default();
        let conversation_data = decode(&keys[1], conversation.as_ref())?.unwrap_or_default();
        let record = decode(&keys[2], private.as_ref())?;

        Ok(Loaded {
            keys,
            user,
            conversation,
            private,
            user_data,
            conversation_data,
            record,
        })
    }

    /// The persisted stack, unless it expired or cannot be resumed here
    fn resumable_stack(
        &self,
        record: Option<&PrivateRecord>,
    ) -> Result<Option<PersistedStack>, DispatchError> {
        let Some(record) = record else {
            return Ok(None);
        };
        let Some(stack) = &record.stack else {
            return Ok(None);
        };

        // A TTL too large for chrono never expires
        let ttl = self
            .config
            .conversation_ttl_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds);
        if let Some(ttl) = ttl {
            let idle = Utc::now() - record.updated_at;
            if idle > ttl {
                info!(idle_secs = idle.num_seconds(), "Conversation expired, starting over");
                return Ok(None);
            }
        }

        if record.registry_fingerprint.as_deref() != Some(self.fingerprint.as_str()) {
            debug!("Dialog set changed since this stack was saved");
        }

        let problem = if stack.version != STACK_FORMAT_VERSION {
            Some(format!(
                "stack format version {} (expected {})",
                stack.version, STACK_FORMAT_VERSION
            ))
        } else if stack.frames.is_empty() {
            Some("stack has no frames".to_string())
        } else if let Some(frame) = stack.frames.iter().find(|f| !f.is_waiting()) {
            Some(format!("frame '{}' has no pending wait", frame.dialog))
        } else {
            stack
                .frames
                .iter()
                .find(|f| !self.registry.contains(&f.dialog))
                .map(|f| format!("dialog '{}' is not registered", f.dialog))
        };

        match (problem, self.config.incompatible_state) {
            (None, _) => Ok(Some(stack.clone())),
            (Some(reason), IncompatibleStatePolicy::Reset) => {
                warn!(%reason, "Discarding incompatible dialog stack");
                Ok(None)
            }
            (Some(reason), IncompatibleStatePolicy::Fail) => {
                Err(DispatchError::IncompatibleState { reason })
            }
        }
    }

    /* ===================== Input ===================== */

    fn input_for(&self, payload: Payload, stack: Option<&PersistedStack>) -> TurnInput {
        let value = match payload {
            Payload::Text(text) => Val::Str(text),
            Payload::Data(value) => value,
            Payload::Error(error) => return TurnInput::Error(error),
            // Like routed text, a target that is not running leaves the stack alone
            Payload::Interrupt {
                target: Some(dialog),
            } if stack.is_some() && !on_stack(stack, &dialog) => {
                debug!(%dialog, "Interrupt target is not on the stack, ignoring");
                return TurnInput::Nothing;
            }
            Payload::Interrupt { target } => return TurnInput::Cancel(cancel_target(target)),
        };

        match self.interrupts.resolve(&value) {
            Some(None) => {
                debug!("Global interrupt: cancel all");
                TurnInput::Cancel(CancelTarget::All)
            }
            // Routed interrupts for dialogs that are not running are plain input
            Some(Some(dialog)) if on_stack(stack, dialog) => {
                debug!(%dialog, "Global interrupt");
                TurnInput::Cancel(CancelTarget::Dialog(dialog.clone()))
            }
            _ => TurnInput::Value(value),
        }
    }

    /* ===================== Save ===================== */

    async fn save(&self, writes: Vec<Write>) -> Result<(), DispatchError> {
        match self.store.save(writes).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { key }) => {
                warn!(%key, "Concurrent turn saved first, dropping this turn");
                Err(DispatchError::Conflict { key })
            }
            Err(e) => Err(DispatchError::Storage(e)),
        }
    }
}

fn cancel_target(target: Option<String>) -> CancelTarget {
    match target {
        Some(dialog) => CancelTarget::Dialog(dialog),
        None => CancelTarget::All,
    }
}

fn on_stack(stack: Option<&PersistedStack>, dialog: &str) -> bool {
    stack.is_some_and(|s| s.frames.iter().any(|f| f.dialog == dialog))
}

fn decode<T: serde::de::DeserializeOwned>(
    key: &StateKey,
    record: Option<&Versioned>,
) -> Result<Option<T>, DispatchError> {
    record
        .map(|r| serde_json::from_value(r.data.clone()))
        .transpose()
        .map_err(|source| DispatchError::CorruptState {
            key: key.clone(),
            source,
        })
}
