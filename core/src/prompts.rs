//! Built-in prompt dialogs
//!
//! Each prompt sends its question, waits for text, and either returns the
//! parsed answer to its caller or re-asks. After `max_attempts` invalid
//! answers it fails with `TOO_MANY_ATTEMPTS`.
//!
//! ```ignore
//! let options = PromptOptions::new("How old are you?").with_range(0.0, 150.0);
//! ctx.call(prompts::NUMBER, options.to_val()?, "got_age");
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{Dialog, DialogContext, DialogRegistry, DialogResult, Outcome};
use crate::error::{ErrorInfo, TOO_MANY_ATTEMPTS};
use crate::value::{Val, ValType};

pub const TEXT: &str = "prompt.text";
pub const CONFIRM: &str = "prompt.confirm";
pub const NUMBER: &str = "prompt.number";
pub const CHOICE: &str = "prompt.choice";

const REPLY_STEP: &str = "reply";

/// Arguments accepted by every prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptOptions {
    pub prompt: String,
    /// Sent instead of `prompt` after an invalid answer
    #[serde(default)]
    pub retry_prompt: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Options for `prompt.choice`
    #[serde(default)]
    pub choices: Vec<String>,
    /// Inclusive bounds for `prompt.number`
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

fn default_max_attempts() -> u32 {
    3
}

impl PromptOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            retry_prompt: None,
            max_attempts: default_max_attempts(),
            choices: Vec::new(),
            min: None,
            max: None,
        }
    }

    pub fn with_retry(mut self, retry_prompt: impl Into<String>) -> Self {
        self.retry_prompt = Some(retry_prompt.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn to_val(&self) -> Result<Val, serde_json::Error> {
        Val::from_typed(self)
    }
}

/// Frame state of a running prompt
#[derive(Debug, Default, Serialize, Deserialize)]
struct PromptState {
    options: Option<PromptOptions>,
    attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Text,
    Confirm,
    Number,
    Choice,
}

impl PromptKind {
    pub fn dialog_id(&self) -> &'static str {
        match self {
            PromptKind::Text => TEXT,
            PromptKind::Confirm => CONFIRM,
            PromptKind::Number => NUMBER,
            PromptKind::Choice => CHOICE,
        }
    }
}

/// One prompt dialog, parameterized by kind
pub struct Prompt {
    kind: PromptKind,
}

impl Prompt {
    pub fn new(kind: PromptKind) -> Self {
        Self { kind }
    }

    fn ask(&self, ctx: &mut DialogContext<'_>, text: &str, options: &PromptOptions) {
        if self.kind == PromptKind::Choice && !options.choices.is_empty() {
            ctx.say(format!("{} ({})", text, options.choices.join(", ")));
        } else {
            ctx.say(text);
        }
    }

    /// Parse an answer, or `None` if it is not acceptable
    fn recognize(&self, input: &str, options: &PromptOptions) -> Option<Val> {
        let input = input.trim();
        match self.kind {
            PromptKind::Text => (!input.is_empty()).then(|| Val::str(input)),
            PromptKind::Confirm => match input.to_lowercase().as_str() {
                "yes" | "y" | "yeah" | "yep" | "sure" | "ok" | "true" => Some(Val::Bool(true)),
                "no" | "n" | "nope" | "false" => Some(Val::Bool(false)),
                _ => None,
            },
            PromptKind::Number => {
                let n: f64 = input.parse().ok()?;
                let in_range = n.is_finite()
                    && options.min.map_or(true, |min| n >= min)
                    && options.max.map_or(true, |max| n <= max);
                in_range.then_some(Val::Num(n))
            }
            PromptKind::Choice => {
                if let Ok(index) = input.parse::<usize>() {
                    return index
                        .checked_sub(1)
                        .and_then(|i| options.choices.get(i))
                        .map(|c| Val::str(c.as_str()));
                }
                options
                    .choices
                    .iter()
                    .find(|c| c.eq_ignore_ascii_case(input))
                    .map(|c| Val::str(c.as_str()))
            }
        }
    }
}

impl Dialog for Prompt {
    fn start(&self, ctx: &mut DialogContext<'_>, args: Val) -> DialogResult {
        let options: PromptOptions = args.to_typed().map_err(|e| {
            ErrorInfo::dialog(format!("Invalid options for {}: {}", self.kind.dialog_id(), e))
        })?;
        if self.kind == PromptKind::Choice && options.choices.is_empty() {
            return Err(ErrorInfo::dialog("prompt.choice needs at least one choice"));
        }

        self.ask(ctx, &options.prompt, &options);
        ctx.set_state(&PromptState {
            options: Some(options),
            attempts: 0,
        })?;
        ctx.wait(ValType::Str, REPLY_STEP);
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult {
        if step != REPLY_STEP {
            return ctx.unknown_step();
        }
        let input = outcome.into_result()?;
        let mut state: PromptState = ctx.state()?;
        let options = state
            .options
            .take()
            .ok_or_else(|| ErrorInfo::dialog("prompt resumed without options"))?;

        if let Some(answer) = input.as_str().and_then(|s| self.recognize(s, &options)) {
            ctx.done(answer);
            return Ok(());
        }

        state.attempts += 1;
        debug!(dialog = self.kind.dialog_id(), attempts = state.attempts, "Invalid answer");
        if state.attempts >= options.max_attempts {
            ctx.fail(ErrorInfo::new(
                TOO_MANY_ATTEMPTS,
                format!("No valid answer after {} attempts", state.attempts),
            ));
            return Ok(());
        }

        let retry = options.retry_prompt.as_deref().unwrap_or(&options.prompt);
        self.ask(ctx, retry, &options);
        state.options = Some(options);
        ctx.set_state(&state)?;
        ctx.wait(ValType::Str, REPLY_STEP);
        Ok(())
    }
}

/// Install all prompt dialogs
pub fn register(registry: &mut DialogRegistry) {
    for kind in [
        PromptKind::Text,
        PromptKind::Confirm,
        PromptKind::Number,
        PromptKind::Choice,
    ] {
        registry.register(kind.dialog_id(), Prompt::new(kind));
    }
}
