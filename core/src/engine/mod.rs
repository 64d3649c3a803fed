//! # Dialog Engine - Resumable Continuation Stack
//!
//! ## Core Principles
//!
//! 1. **Stack-driven execution**: All state in `frames: Vec<Frame>`, no recursion
//! 2. **Durable waits**: A suspension point is data (`Wait { expected, step }`), never a closure
//! 3. **Centralized control flow**: `Control` enum carries start/resume between steps
//! 4. **Pure engine**: No DB, no async - just runs until suspended, completed or failed
//!
//! Persistence, bags and message delivery live in `crate::dispatch`.

pub mod context;
pub mod control;
pub mod dialog;
pub mod fiber;
pub mod frame;
pub mod turn;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use context::{DialogContext, TurnScope};
pub use control::{
    CancelTarget, Control, FiberState, Outcome, PersistedStack, RunState, STACK_FORMAT_VERSION,
};
pub use dialog::{Dialog, DialogRegistry, DialogResult, START_STEP};
pub use fiber::{EngineConfig, Fiber};
pub use frame::{Frame, Stack, Wait};
pub use turn::{run_turn, RootDialog, TurnInput, TurnResult};
