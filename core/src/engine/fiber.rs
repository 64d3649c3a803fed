//! Continuation engine
//!
//! A `Fiber` owns the dialog stack and the pending control transfer. It is
//! driven explicitly: the caller posts input (or an error, or a cancel) and
//! calls `run`, which invokes dialog steps until the stack is suspended on a
//! fresh wait or empty.
//!
//! ## Function Organization
//! 1. Entry points: `start_root`, `post`, `fail`, `cancel`, `reset`
//! 2. `run()` - drives `step()` until suspension or termination
//! 3. `step()` - applies one pending control transfer
//! 4. `invoke()` / `apply()` - call into dialog code and apply its transfer

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::context::{DialogContext, Transfer, TurnScope};
use super::control::{
    CancelTarget, Control, FiberState, Outcome, PersistedStack, RunState, STACK_FORMAT_VERSION,
};
use super::dialog::{Dialog, DialogRegistry, DialogResult, START_STEP};
use super::frame::{Frame, Stack};
use crate::error::{EngineError, ErrorInfo, ProtocolViolation};
use crate::value::Val;

/// Engine limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum dialog step invocations in a single run
    pub max_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_steps: 1000 }
    }
}

/// One conversation's dialog stack plus its pending control transfer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fiber {
    stack: Stack,
    control: Control,
}

/// Result of one `step()`
enum Step {
    Continue,
    Stop(RunState),
}

impl Fiber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a suspended fiber from a checkpoint
    pub fn restore(persisted: PersistedStack) -> Self {
        Self {
            stack: Stack::from_frames(persisted.frames),
            control: Control::None,
        }
    }

    /// Checkpoint the fiber
    ///
    /// Returns `None` once the stack is empty (conversation over). Only a
    /// suspended fiber whose every frame holds a wait can be checkpointed.
    pub fn checkpoint(&self) -> Result<Option<PersistedStack>, ProtocolViolation> {
        if self.control != Control::None {
            return Err(ProtocolViolation::NotCheckpointable);
        }
        if self.stack.is_empty() {
            return Ok(None);
        }
        if self.stack.frames().iter().any(|f| !f.is_waiting()) {
            return Err(ProtocolViolation::NotCheckpointable);
        }
        Ok(Some(PersistedStack {
            version: STACK_FORMAT_VERSION,
            frames: self.stack.frames().to_vec(),
        }))
    }

    pub fn state(&self) -> FiberState {
        if self.stack.is_empty() {
            return FiberState::Terminated;
        }
        match (&self.control, self.stack.peek()) {
            (Control::None, Ok(top)) if top.is_waiting() => FiberState::Suspended,
            _ => FiberState::Idle,
        }
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    /// The active frame
    pub fn peek(&self) -> Result<&Frame, ProtocolViolation> {
        self.stack.peek()
    }

    /* ===================== Entry Points ===================== */

    /// Push the root dialog of a new conversation
    pub fn start_root(&mut self, dialog: &str, args: Val) -> Result<(), ProtocolViolation> {
        if !self.stack.is_empty() {
            return Err(ProtocolViolation::StackNotEmpty {
                depth: self.stack.depth(),
            });
        }
        self.stack.push(Frame::new(dialog));
        self.control = Control::Start(args);
        Ok(())
    }

    /// Supply a value to the pending wait
    ///
    /// The value is checked against the wait's expected type here, so a
    /// mismatch leaves the fiber untouched.
    pub fn post(&mut self, value: Val) -> Result<(), ProtocolViolation> {
        let top = self.suspended_top("post")?;
        let wait = top.wait.as_ref().ok_or_else(|| ProtocolViolation::NotSuspended {
            dialog: top.dialog.clone(),
        })?;
        if !wait.expected.accepts(&value) {
            return Err(ProtocolViolation::TypeMismatch {
                dialog: top.dialog.clone(),
                step: wait.step.clone(),
                expected: wait.expected,
                actual: value.type_of(),
            });
        }
        self.control = Control::Resume(Outcome::Value(value));
        Ok(())
    }

    /// Deliver an error to the pending wait
    pub fn fail(&mut self, error: ErrorInfo) -> Result<(), ProtocolViolation> {
        self.suspended_top("fail")?;
        self.control = Control::Resume(Outcome::Error(error));
        Ok(())
    }

    /// Pop frames down to `target` and route a canceled error into its wait
    ///
    /// `CancelTarget::All` empties the stack outright.
    pub fn cancel(&mut self, target: CancelTarget) -> Result<(), ProtocolViolation> {
        self.suspended_top("cancel")?;

        let keep = match &target {
            CancelTarget::All => {
                debug!(depth = self.stack.depth(), "Canceling all dialogs");
                self.reset();
                return Ok(());
            }
            CancelTarget::Depth(depth) if *depth >= 1 && *depth <= self.stack.depth() => *depth,
            CancelTarget::Depth(depth) => {
                return Err(ProtocolViolation::CancelTargetNotFound(format!("depth {depth}")))
            }
            CancelTarget::Dialog(id) => self
                .stack
                .position_of(id)
                .map(|idx| idx + 1)
                .ok_or_else(|| ProtocolViolation::CancelTargetNotFound(id.clone()))?,
        };

        debug!(
            from_depth = self.stack.depth(),
            to_depth = keep,
            "Canceling dialogs"
        );
        self.stack.truncate(keep);
        self.control = Control::Resume(Outcome::Error(ErrorInfo::canceled()));
        Ok(())
    }

    /// Drop all frames and pending control
    pub fn reset(&mut self) {
        self.stack.clear();
        self.control = Control::None;
    }

    fn suspended_top(&self, op: &'static str) -> Result<&Frame, ProtocolViolation> {
        let top = self.stack.peek().map_err(|_| ProtocolViolation::EmptyStack { op })?;
        if self.control != Control::None || !top.is_waiting() {
            return Err(ProtocolViolation::NotSuspended {
                dialog: top.dialog.clone(),
            });
        }
        Ok(top)
    }

    /* ===================== Run Loop ===================== */

    /// Drive pending transfers until the fiber suspends or terminates
    ///
    /// On `Err(EngineError::Unhandled)` the stack has been unwound to empty.
    /// On a protocol violation the fiber is left as it was at the failing
    /// step and must not be checkpointed.
    pub fn run(
        &mut self,
        registry: &DialogRegistry,
        scope: &mut TurnScope,
        config: &EngineConfig,
    ) -> Result<RunState, EngineError> {
        if self.stack.is_empty() && self.control == Control::None {
            return Err(ProtocolViolation::EmptyStack { op: "run" }.into());
        }

        let mut steps = 0usize;
        loop {
            match self.step(registry, scope, &mut steps, config)? {
                Step::Continue => continue,
                Step::Stop(state) => return Ok(state),
            }
        }
    }

    fn step(
        &mut self,
        registry: &DialogRegistry,
        scope: &mut TurnScope,
        steps: &mut usize,
        config: &EngineConfig,
    ) -> Result<Step, EngineError> {
        match std::mem::take(&mut self.control) {
            Control::None => {
                let top = self.stack.peek().map_err(|_| ProtocolViolation::EmptyStack { op: "run" })?;
                if top.is_waiting() {
                    Ok(Step::Stop(RunState::Suspended))
                } else {
                    Err(ProtocolViolation::NotSuspended {
                        dialog: top.dialog.clone(),
                    }
                    .into())
                }
            }

            Control::Start(args) => {
                count_step(steps, config)?;
                let dialog = self.behavior(registry)?;
                self.invoke(scope, START_STEP, |d, ctx| d.start(ctx, args), dialog.as_ref())?;
                Ok(Step::Continue)
            }

            Control::Resume(outcome) if self.stack.is_empty() => match outcome {
                Outcome::Value(value) => {
                    debug!("Root dialog completed");
                    Ok(Step::Stop(RunState::Completed(value)))
                }
                Outcome::Error(error) => {
                    debug!(code = %error.code, "Error reached the root unhandled");
                    Err(EngineError::Unhandled(error))
                }
            },

            Control::Resume(outcome) => {
                let top = self.stack.peek_mut()?;
                let Some(wait) = top.wait.take() else {
                    return Err(ProtocolViolation::NotSuspended {
                        dialog: top.dialog.clone(),
                    }
                    .into());
                };

                match &outcome {
                    Outcome::Error(error) if !wait.catch => {
                        // No handler here: unwind one frame and retry on the parent
                        trace!(dialog = %top.dialog, code = %error.code, "Unwinding frame");
                        self.stack.pop()?;
                        self.control = Control::Resume(outcome);
                        return Ok(Step::Continue);
                    }
                    Outcome::Value(value) if !wait.expected.accepts(value) => {
                        let violation = ProtocolViolation::TypeMismatch {
                            dialog: top.dialog.clone(),
                            step: wait.step.clone(),
                            expected: wait.expected,
                            actual: value.type_of(),
                        };
                        top.wait = Some(wait);
                        return Err(violation.into());
                    }
                    _ => {}
                }

                count_step(steps, config)?;
                let dialog = self.behavior(registry)?;
                let step = wait.step;
                self.invoke(
                    scope,
                    &step,
                    |d, ctx| d.resume(ctx, &step, outcome),
                    dialog.as_ref(),
                )?;
                Ok(Step::Continue)
            }
        }
    }

    fn behavior(&self, registry: &DialogRegistry) -> Result<std::sync::Arc<dyn Dialog>, ProtocolViolation> {
        let top = self.stack.peek()?;
        registry
            .get(&top.dialog)
            .ok_or_else(|| ProtocolViolation::UnknownDialog(top.dialog.clone()))
    }

    /// Run one dialog step against the active frame and apply its transfer
    fn invoke<F>(
        &mut self,
        scope: &mut TurnScope,
        step: &str,
        f: F,
        dialog: &dyn Dialog,
    ) -> Result<(), EngineError>
    where
        F: FnOnce(&dyn Dialog, &mut DialogContext<'_>) -> DialogResult,
    {
        let depth = self.stack.depth();
        let frame = self.stack.peek_mut()?;
        let dialog_id = frame.dialog.clone();

        debug!(dialog = %dialog_id, step = %step, depth, "Invoking dialog step");

        let mut ctx = DialogContext::new(&dialog_id, step, depth, &mut frame.state, scope);
        let result = f(dialog, &mut ctx);
        let (transfer, violation) = ctx.finish();

        if let Some(violation) = violation {
            return Err(violation.into());
        }

        let transfer = match (result, transfer) {
            (Err(error), _) => Transfer::Fail(error),
            (Ok(()), Some(transfer)) => transfer,
            (Ok(()), None) => {
                return Err(ProtocolViolation::NoResumeHandler {
                    dialog: dialog_id,
                    step: step.to_string(),
                }
                .into())
            }
        };

        self.apply(transfer)
    }

    fn apply(&mut self, transfer: Transfer) -> Result<(), EngineError> {
        match transfer {
            Transfer::Wait(wait) => {
                self.stack.peek_mut()?.wait = Some(wait);
                self.control = Control::None;
            }
            Transfer::Call { dialog, args, ret } => {
                self.stack.peek_mut()?.wait = Some(ret);
                self.stack.push(Frame::new(dialog));
                self.control = Control::Start(args);
            }
            Transfer::Done(value) => {
                self.stack.pop()?;
                self.control = Control::Resume(Outcome::Value(value));
            }
            Transfer::Fail(error) => {
                self.stack.pop()?;
                self.control = Control::Resume(Outcome::Error(error));
            }
        }
        Ok(())
    }
}

fn count_step(steps: &mut usize, config: &EngineConfig) -> Result<(), ProtocolViolation> {
    *steps += 1;
    if *steps > config.max_steps {
        return Err(ProtocolViolation::StepLimitExceeded(config.max_steps));
    }
    Ok(())
}
