//! What a dialog step can see and do

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::frame::Wait;
use crate::error::{ErrorInfo, ProtocolViolation};
use crate::message::{OutgoingMessage, Outbox};
use crate::state::Bag;
use crate::value::{Val, ValType};

/// Per-turn resources shared by every frame
///
/// The bags persist across turns independently of the stack; the outbox is
/// flushed by the caller after the run.
#[derive(Debug, Default)]
pub struct TurnScope {
    pub user_data: Bag,
    pub conversation_data: Bag,
    pub private_data: Bag,
    pub outbox: Outbox,
}

impl TurnScope {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Control transfer requested by a step
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Transfer {
    Wait(Wait),
    Call { dialog: String, args: Val, ret: Wait },
    Done(Val),
    Fail(ErrorInfo),
}

/// Handle passed to `Dialog::start` and `Dialog::resume`
pub struct DialogContext<'a> {
    dialog: &'a str,
    step: &'a str,
    depth: usize,
    state: &'a mut JsonValue,
    scope: &'a mut TurnScope,
    transfer: Option<Transfer>,
    violation: Option<ProtocolViolation>,
}

impl<'a> DialogContext<'a> {
    pub(crate) fn new(
        dialog: &'a str,
        step: &'a str,
        depth: usize,
        state: &'a mut JsonValue,
        scope: &'a mut TurnScope,
    ) -> Self {
        Self {
            dialog,
            step,
            depth,
            state,
            scope,
            transfer: None,
            violation: None,
        }
    }

    pub(crate) fn finish(self) -> (Option<Transfer>, Option<ProtocolViolation>) {
        (self.transfer, self.violation)
    }

    pub fn dialog_id(&self) -> &str {
        self.dialog
    }

    pub fn step(&self) -> &str {
        self.step
    }

    /// Number of frames on the stack, this one included
    pub fn depth(&self) -> usize {
        self.depth
    }

    /* ===================== Transfers ===================== */

    fn transfer(&mut self, transfer: Transfer) {
        if self.transfer.is_some() {
            self.violation.get_or_insert(ProtocolViolation::MultipleResumeHandlers {
                dialog: self.dialog.to_string(),
                step: self.step.to_string(),
            });
            return;
        }
        self.transfer = Some(transfer);
    }

    /// Suspend until a value of `expected` type arrives, then run `step`
    pub fn wait(&mut self, expected: ValType, step: &str) {
        self.transfer(Transfer::Wait(Wait::new(expected, step)));
    }

    /// Like `wait`, but errors delivered here are handed to `step`
    pub fn wait_catching(&mut self, expected: ValType, step: &str) {
        self.transfer(Transfer::Wait(Wait::catching(expected, step)));
    }

    /// Invoke a child dialog; its result is delivered to `step`
    ///
    /// Errors raised by the child skip `step` and continue to this dialog's
    /// caller.
    pub fn call(&mut self, dialog: &str, args: Val, step: &str) {
        self.transfer(Transfer::Call {
            dialog: dialog.to_string(),
            args,
            ret: Wait::new(ValType::Any, step),
        });
    }

    /// Invoke a child dialog and handle its errors in `step`
    pub fn call_catching(&mut self, dialog: &str, args: Val, step: &str) {
        self.transfer(Transfer::Call {
            dialog: dialog.to_string(),
            args,
            ret: Wait::catching(ValType::Any, step),
        });
    }

    /// Invoke a child dialog whose result must be of type `expected`
    pub fn call_expecting(&mut self, dialog: &str, args: Val, expected: ValType, step: &str) {
        self.transfer(Transfer::Call {
            dialog: dialog.to_string(),
            args,
            ret: Wait::new(expected, step),
        });
    }

    /// Complete this dialog and return `value` to the caller
    pub fn done(&mut self, value: Val) {
        self.transfer(Transfer::Done(value));
    }

    /// Complete this dialog with an error
    pub fn fail(&mut self, error: ErrorInfo) {
        self.transfer(Transfer::Fail(error));
    }

    /// Report that the dialog was resumed at a step it does not define
    pub fn unknown_step(&mut self) -> Result<(), ErrorInfo> {
        self.violation.get_or_insert(ProtocolViolation::UnknownStep {
            dialog: self.dialog.to_string(),
            step: self.step.to_string(),
        });
        Ok(())
    }

    /* ===================== Messages ===================== */

    /// Queue a text reply
    pub fn say(&mut self, text: impl Into<String>) {
        self.scope.outbox.push(OutgoingMessage::text(text));
    }

    pub fn send(&mut self, message: OutgoingMessage) {
        self.scope.outbox.push(message);
    }

    /* ===================== Frame State ===================== */

    /// This frame's local state, or `T::default()` if none was stored
    pub fn state<T: DeserializeOwned + Default>(&self) -> Result<T, ErrorInfo> {
        if self.state.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.state.clone()).map_err(|e| {
            ErrorInfo::dialog(format!("Corrupt state for dialog '{}': {}", self.dialog, e))
        })
    }

    pub fn set_state<T: Serialize>(&mut self, state: &T) -> Result<(), ErrorInfo> {
        *self.state = serde_json::to_value(state).map_err(|e| {
            ErrorInfo::dialog(format!("Unserializable state for dialog '{}': {}", self.dialog, e))
        })?;
        Ok(())
    }

    /* ===================== Bags ===================== */

    pub fn user_data(&mut self) -> &mut Bag {
        &mut self.scope.user_data
    }

    pub fn conversation_data(&mut self) -> &mut Bag {
        &mut self.scope.conversation_data
    }

    pub fn private_data(&mut self) -> &mut Bag {
        &mut self.scope.private_data
    }
}
