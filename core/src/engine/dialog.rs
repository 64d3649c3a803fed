//! Dialog behavior and the registry that resolves it
//!
//! Behavior is stateless and looked up by id on every invocation; all state
//! a dialog needs across turns lives in its frame.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::context::DialogContext;
use super::control::Outcome;
use crate::error::ErrorInfo;
use crate::value::Val;

/// Returned by dialog steps. `Err` is a thrown error and takes the Fail path.
pub type DialogResult = Result<(), ErrorInfo>;

/// Step name reported for a dialog's entry point
pub const START_STEP: &str = "start";

/// A unit of conversational logic
///
/// Every invocation must end with exactly one transfer on the context:
/// `wait`, `call`, `done` or `fail` (returning `Err` counts as `fail`).
pub trait Dialog: Send + Sync {
    /// Entry point, run when the dialog is pushed
    fn start(&self, ctx: &mut DialogContext<'_>, args: Val) -> DialogResult;

    /// Continuation named `step`, run when that wait is satisfied
    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult;
}

/// Lookup table from dialog id to behavior
#[derive(Clone, Default)]
pub struct DialogRegistry {
    dialogs: HashMap<String, Arc<dyn Dialog>>,
}

impl DialogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dialog, replacing any previous behavior with the same id
    pub fn register(&mut self, id: impl Into<String>, dialog: impl Dialog + 'static) -> &mut Self {
        self.dialogs.insert(id.into(), Arc::new(dialog));
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Dialog>> {
        self.dialogs.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dialogs.contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.dialogs.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    /// Hash of the registered ids
    ///
    /// Stored next to persisted stacks so a deployment with a different
    /// dialog set can recognize state it may not be able to resume.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for id in self.ids() {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Debug for DialogRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogRegistry")
            .field("dialogs", &self.ids())
            .finish()
    }
}
