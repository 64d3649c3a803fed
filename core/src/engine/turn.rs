//! One turn of a conversation, with no I/O
//!
//! `run_turn` is the whole suspend/resume protocol in one call: rebuild the
//! fiber from a checkpoint and feed it the turn's input (or start the root
//! dialog with that input), run it, and checkpoint it again.

use tracing::debug;

use super::context::TurnScope;
use super::control::{CancelTarget, FiberState, PersistedStack, RunState};
use super::dialog::DialogRegistry;
use super::fiber::{EngineConfig, Fiber};
use crate::error::{EngineError, ErrorInfo};
use crate::message::OutgoingMessage;
use crate::value::Val;

/// Input delivered to the suspended wait
#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    Value(Val),
    Error(ErrorInfo),
    Cancel(CancelTarget),
    /// No input; only starts a fresh conversation
    Nothing,
}

/// Dialog to push when there is no checkpoint
///
/// `args` is used only when the turn has no input value of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct RootDialog {
    pub id: String,
    pub args: Val,
}

impl RootDialog {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            args: Val::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    /// `None` once the conversation has ended
    pub checkpoint: Option<PersistedStack>,
    /// Root dialog's return value when it completed this turn
    pub completed: Option<Val>,
    /// Messages queued during the run, in order
    pub messages: Vec<OutgoingMessage>,
}

/// Advance a conversation by one inbound input
///
/// On error, messages queued before the failure are left in `scope.outbox`
/// so the caller can decide whether to deliver them.
pub fn run_turn(
    registry: &DialogRegistry,
    config: &EngineConfig,
    root: &RootDialog,
    persisted: Option<PersistedStack>,
    input: TurnInput,
    scope: &mut TurnScope,
) -> Result<TurnResult, EngineError> {
    let mut fiber = match persisted {
        Some(persisted) => {
            debug!(depth = persisted.depth(), "Resuming dialog stack");
            Fiber::restore(persisted)
        }
        None => return start_conversation(registry, config, root, input, scope),
    };

    match input {
        TurnInput::Value(value) => fiber.post(value)?,
        TurnInput::Error(error) => fiber.fail(error)?,
        TurnInput::Cancel(target) => fiber.cancel(target)?,
        TurnInput::Nothing => {}
    }

    let mut completed = None;
    if fiber.state() == FiberState::Idle {
        if let RunState::Completed(value) = fiber.run(registry, scope, config)? {
            completed = Some(value);
        }
    }

    Ok(TurnResult {
        checkpoint: fiber.checkpoint()?,
        completed,
        messages: scope.outbox.drain(),
    })
}

/// Push the root dialog and run it to its first suspension
///
/// The input that opened the conversation becomes the root's arguments.
/// An error or cancel has nothing to act on yet.
fn start_conversation(
    registry: &DialogRegistry,
    config: &EngineConfig,
    root: &RootDialog,
    input: TurnInput,
    scope: &mut TurnScope,
) -> Result<TurnResult, EngineError> {
    let args = match input {
        TurnInput::Value(value) => value,
        TurnInput::Nothing => root.args.clone(),
        TurnInput::Error(error) => return Err(EngineError::Unhandled(error)),
        TurnInput::Cancel(_) => {
            return Ok(TurnResult {
                checkpoint: None,
                completed: None,
                messages: Vec::new(),
            })
        }
    };

    debug!(root = %root.id, "Starting root dialog");
    let mut fiber = Fiber::new();
    fiber.start_root(&root.id, args)?;
    let completed = match fiber.run(registry, scope, config)? {
        RunState::Completed(value) => Some(value),
        RunState::Suspended => None,
    };

    Ok(TurnResult {
        checkpoint: fiber.checkpoint()?,
        completed,
        messages: scope.outbox.drain(),
    })
}
