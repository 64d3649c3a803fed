//! Test dialogs shared by the engine tests

use serde::{Deserialize, Serialize};

use crate::engine::{
    Dialog, DialogContext, DialogRegistry, DialogResult, EngineConfig, Fiber, Outcome, RunState,
    TurnScope,
};
use crate::error::{EngineError, ErrorInfo};
use crate::value::{Val, ValType};

/// Calls `child`, then waits for a number and returns it
pub struct Root;

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RootState {
    pub ack: String,
}

impl Dialog for Root {
    fn start(&self, ctx: &mut DialogContext<'_>, args: Val) -> DialogResult {
        ctx.call("child", args, "child_done");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult {
        match step {
            "child_done" => {
                let ack = outcome.into_result()?;
                let ack = ack.as_str().unwrap_or_default().to_string();
                ctx.say(format!("root got {ack}"));
                ctx.set_state(&RootState { ack })?;
                ctx.wait(ValType::Num, "got_number");
                Ok(())
            }
            "got_number" => {
                ctx.done(outcome.into_result()?);
                Ok(())
            }
            _ => ctx.unknown_step(),
        }
    }
}

/// Waits for text and acknowledges it
pub struct Child;

impl Dialog for Child {
    fn start(&self, ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        ctx.say("child says hi");
        ctx.wait(ValType::Str, "got_text");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult {
        match step {
            "got_text" => {
                let text = outcome.into_result()?;
                let text = text.as_str().unwrap_or_default();
                ctx.done(Val::str(format!("{text}-ack")));
                Ok(())
            }
            _ => ctx.unknown_step(),
        }
    }
}

/// Fails immediately through `ctx.fail`
pub struct Boom;

impl Dialog for Boom {
    fn start(&self, ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        ctx.fail(ErrorInfo::new("BOOM", "boom"));
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, _step: &str, _outcome: Outcome) -> DialogResult {
        ctx.unknown_step()
    }
}

/// Fails immediately by returning `Err`
pub struct Thrower;

impl Dialog for Thrower {
    fn start(&self, _ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        Err(ErrorInfo::new("THROWN", "thrown from start"))
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, _step: &str, _outcome: Outcome) -> DialogResult {
        ctx.unknown_step()
    }
}

/// Calls the dialog named in its args without handling errors
pub struct Caller;

impl Dialog for Caller {
    fn start(&self, ctx: &mut DialogContext<'_>, args: Val) -> DialogResult {
        let target = args.as_str().unwrap_or("boom").to_string();
        ctx.call(&target, Val::Null, "after");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult {
        match step {
            "after" => {
                ctx.say("caller resumed");
                ctx.done(outcome.into_result()?);
                Ok(())
            }
            _ => ctx.unknown_step(),
        }
    }
}

/// Calls `caller` and handles whatever error comes back
pub struct Outer;

impl Dialog for Outer {
    fn start(&self, ctx: &mut DialogContext<'_>, args: Val) -> DialogResult {
        ctx.call_catching("caller", args, "caught");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult {
        match (step, outcome) {
            ("caught", Outcome::Error(error)) => {
                ctx.say(format!("caught {}", error.code));
                ctx.set_state(&error)?;
                ctx.wait(ValType::Str, "next");
                Ok(())
            }
            ("caught", Outcome::Value(value)) | ("next", Outcome::Value(value)) => {
                ctx.done(value);
                Ok(())
            }
            _ => ctx.unknown_step(),
        }
    }
}

/// Calls `child` and survives its cancellation
pub struct Guard;

impl Dialog for Guard {
    fn start(&self, ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        ctx.call_catching("child", Val::Null, "child_done");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult {
        match (step, outcome) {
            ("child_done", Outcome::Error(error)) if error.is_canceled() => {
                ctx.say("canceled");
                ctx.wait(ValType::Str, "again");
                Ok(())
            }
            ("child_done", outcome) => {
                ctx.done(outcome.into_result()?);
                Ok(())
            }
            ("again", outcome) => {
                ctx.done(outcome.into_result()?);
                Ok(())
            }
            _ => ctx.unknown_step(),
        }
    }
}

/// Counts text inputs in frame state until it receives "stop"
pub struct Counter;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CounterState {
    pub n: u32,
}

impl Dialog for Counter {
    fn start(&self, ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        ctx.wait(ValType::Str, "tick");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult {
        if step != "tick" {
            return ctx.unknown_step();
        }
        let input = outcome.into_result()?;
        let mut state: CounterState = ctx.state()?;
        if input.as_str() == Some("stop") {
            ctx.done(Val::Num(state.n as f64));
            return Ok(());
        }
        state.n += 1;
        ctx.set_state(&state)?;
        ctx.user_data().set("last_count", &state.n)?;
        ctx.say(format!("count {}", state.n));
        ctx.wait(ValType::Str, "tick");
        Ok(())
    }
}

/// Calls `child` but insists on a number back
pub struct Strict;

impl Dialog for Strict {
    fn start(&self, ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        ctx.call_expecting("child", Val::Null, ValType::Num, "got");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, _step: &str, outcome: Outcome) -> DialogResult {
        ctx.say("strict resumed");
        ctx.done(outcome.into_result()?);
        Ok(())
    }
}

/// Returns without transferring control
pub struct Silent;

impl Dialog for Silent {
    fn start(&self, _ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, _step: &str, _outcome: Outcome) -> DialogResult {
        ctx.unknown_step()
    }
}

/// Waits and completes in the same step
pub struct Greedy;

impl Dialog for Greedy {
    fn start(&self, ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        ctx.wait(ValType::Str, "a");
        ctx.done(Val::Null);
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, _step: &str, _outcome: Outcome) -> DialogResult {
        ctx.unknown_step()
    }
}

/// Calls itself forever
pub struct Looper;

impl Dialog for Looper {
    fn start(&self, ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        ctx.call("looper", Val::Null, "back");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, _step: &str, outcome: Outcome) -> DialogResult {
        ctx.done(outcome.into_result()?);
        Ok(())
    }
}

/// Completes immediately with its arguments
pub struct Echo;

impl Dialog for Echo {
    fn start(&self, ctx: &mut DialogContext<'_>, args: Val) -> DialogResult {
        ctx.done(args);
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, _step: &str, _outcome: Outcome) -> DialogResult {
        ctx.unknown_step()
    }
}

/// Complains and fails on the first input
pub struct Grumpy;

impl Dialog for Grumpy {
    fn start(&self, ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        ctx.wait(ValType::Str, "input");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, _step: &str, _outcome: Outcome) -> DialogResult {
        ctx.say("grr");
        Err(ErrorInfo::dialog("grumpy"))
    }
}

pub fn registry() -> DialogRegistry {
    let mut registry = DialogRegistry::new();
    registry
        .register("root", Root)
        .register("child", Child)
        .register("boom", Boom)
        .register("thrower", Thrower)
        .register("caller", Caller)
        .register("outer", Outer)
        .register("guard", Guard)
        .register("counter", Counter)
        .register("strict", Strict)
        .register("silent", Silent)
        .register("greedy", Greedy)
        .register("looper", Looper)
        .register("echo", Echo)
        .register("grumpy", Grumpy);
    registry
}

/// Start `dialog` as the root and run to its first suspension
pub fn start(dialog: &str, args: Val, scope: &mut TurnScope) -> (Fiber, Result<RunState, EngineError>) {
    let mut fiber = Fiber::new();
    fiber.start_root(dialog, args).unwrap();
    let result = fiber.run(&registry(), scope, &EngineConfig::default());
    (fiber, result)
}

pub fn run(fiber: &mut Fiber, scope: &mut TurnScope) -> Result<RunState, EngineError> {
    fiber.run(&registry(), scope, &EngineConfig::default())
}

/// Texts queued on the outbox, draining it
pub fn said(scope: &mut TurnScope) -> Vec<String> {
    scope
        .outbox
        .drain()
        .into_iter()
        .filter_map(|m| m.text)
        .collect()
}
