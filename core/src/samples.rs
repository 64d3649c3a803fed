//! Sample dialogs used by `parley chat`
//!
//! `profile` is a small menu-driven root dialog. It routes commands through a
//! `RouteTable`, collects a profile with the built-in prompts in a child
//! dialog and keeps the result in the user bag, so it survives across
//! conversations.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{Dialog, DialogContext, DialogRegistry, DialogResult, Outcome};
use crate::error::ErrorInfo;
use crate::prompts::{self, PromptOptions};
use crate::routing::{Matcher, RouteTable};
use crate::value::{Val, ValType};

pub const ROOT: &str = "profile";
pub const COLLECT: &str = "profile.collect";

/// User bag key holding the saved `Profile`
pub const PROFILE_KEY: &str = "profile";

const GREETING: &str = "Hi! I can keep a short profile for you. Type 'help' to see what I can do.";
const HELP: &str = "Commands: 'profile' to fill in your profile, 'show' to see it, \
                    'reset' to forget it, 'bye' to leave. 'menu' stops whatever we are doing.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub age: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Help,
    Edit,
    Show,
    Reset,
    Bye,
}

/* ===================== Root Menu ===================== */

pub struct ProfileMenu {
    commands: RouteTable<Command>,
}

impl ProfileMenu {
    pub fn new() -> Self {
        let commands = RouteTable::new()
            .route(Matcher::keywords(&["help"]), Command::Help)
            .route(Matcher::keywords(&["reset", "forget"]), Command::Reset)
            .route(Matcher::keywords(&["show"]), Command::Show)
            .route(Matcher::keywords(&["profile", "edit"]), Command::Edit)
            .route(Matcher::intent("profile.edit", 0.5), Command::Edit)
            .route(Matcher::keywords(&["bye", "quit"]), Command::Bye);
        Self { commands }
    }

    /// Interrupts aimed at the menu land here as a canceled error
    fn await_command(ctx: &mut DialogContext<'_>) {
        ctx.wait_catching(ValType::Any, "command");
    }

    fn run(&self, ctx: &mut DialogContext<'_>, command: Command) -> DialogResult {
        debug!(?command, "Profile menu command");
        match command {
            Command::Help => {
                ctx.say(HELP);
                Self::await_command(ctx);
            }
            Command::Edit => {
                if ctx.user_data().contains(PROFILE_KEY) {
                    let options = PromptOptions::new("You already have a profile. Replace it?");
                    ctx.call_catching(prompts::CONFIRM, options.to_val()?, "replace");
                } else {
                    ctx.call_catching(COLLECT, Val::Null, "collected");
                }
            }
            Command::Show => {
                let saved = ctx.user_data().get::<Profile>(PROFILE_KEY)?;
                match saved {
                    Some(profile) => ctx.say(format!("{}, {}", profile.name, profile.age)),
                    None => ctx.say("No profile yet. Type 'profile' to create one."),
                }
                Self::await_command(ctx);
            }
            Command::Reset => {
                ctx.user_data().remove(PROFILE_KEY);
                ctx.say("I forgot your profile.");
                Self::await_command(ctx);
            }
            Command::Bye => {
                ctx.say("Bye!");
                ctx.done(Val::Null);
            }
        }
        Ok(())
    }

    /// A child ended with an error; the menu stays up
    fn interrupted(ctx: &mut DialogContext<'_>, error: &ErrorInfo) {
        if error.is_canceled() {
            ctx.say("Okay, stopped.");
        } else {
            ctx.say("Let's try that again later.");
        }
        Self::await_command(ctx);
    }
}

impl Default for ProfileMenu {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialog for ProfileMenu {
    fn start(&self, ctx: &mut DialogContext<'_>, args: Val) -> DialogResult {
        ctx.say(GREETING);
        // The opening message may already be a command
        match self.commands.resolve(&args) {
            Some(command) => self.run(ctx, *command),
            None => {
                Self::await_command(ctx);
                Ok(())
            }
        }
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult {
        match (step, outcome) {
            ("command", Outcome::Value(input)) => {
                match self.commands.resolve(&input) {
                    Some(command) => self.run(ctx, *command),
                    None => {
                        ctx.say("Sorry, I didn't get that. Type 'help' for options.");
                        Self::await_command(ctx);
                        Ok(())
                    }
                }
            }
            ("replace", Outcome::Value(Val::Bool(true))) => {
                ctx.call_catching(COLLECT, Val::Null, "collected");
                Ok(())
            }
            ("replace", Outcome::Value(_)) => {
                ctx.say("Keeping your profile.");
                Self::await_command(ctx);
                Ok(())
            }
            ("collected", Outcome::Value(value)) => {
                let profile: Profile = value.to_typed()?;
                ctx.say(format!("Thanks, {}! Your profile is saved.", profile.name));
                Self::await_command(ctx);
                Ok(())
            }
            ("command" | "replace" | "collected", Outcome::Error(error)) => {
                Self::interrupted(ctx, &error);
                Ok(())
            }
            _ => ctx.unknown_step(),
        }
    }
}

/* ===================== Profile Collection ===================== */

#[derive(Debug, Default, Serialize, Deserialize)]
struct CollectState {
    name: Option<String>,
}

/// Asks for name and age, saves them to the user bag and returns the profile
pub struct ProfileCollector;

impl Dialog for ProfileCollector {
    fn start(&self, ctx: &mut DialogContext<'_>, _args: Val) -> DialogResult {
        let options = PromptOptions::new("What's your name?");
        ctx.call(prompts::TEXT, options.to_val()?, "name");
        Ok(())
    }

    fn resume(&self, ctx: &mut DialogContext<'_>, step: &str, outcome: Outcome) -> DialogResult {
        let input = outcome.into_result()?;
        match step {
            "name" => {
                let name = input
                    .as_str()
                    .ok_or_else(|| ErrorInfo::dialog("name prompt returned a non-string"))?;
                ctx.set_state(&CollectState {
                    name: Some(name.to_string()),
                })?;

                let options = PromptOptions::new(format!("How old are you, {name}?"))
                    .with_retry("Please answer with a number from 0 to 150.")
                    .with_range(0.0, 150.0);
                ctx.call_expecting(prompts::NUMBER, options.to_val()?, ValType::Num, "age");
                Ok(())
            }
            "age" => {
                let state: CollectState = ctx.state()?;
                let name = state
                    .name
                    .ok_or_else(|| ErrorInfo::dialog("age received before name"))?;
                let age = input
                    .as_num()
                    .ok_or_else(|| ErrorInfo::dialog("age prompt returned a non-number"))?
                    as u32;

                let profile = Profile { name, age };
                ctx.user_data().set(PROFILE_KEY, &profile)?;
                ctx.done(Val::from_typed(&profile)?);
                Ok(())
            }
            _ => ctx.unknown_step(),
        }
    }
}

/// Install the sample dialogs and the prompts they use
pub fn register(registry: &mut DialogRegistry) {
    prompts::register(registry);
    registry
        .register(ROOT, ProfileMenu::new())
        .register(COLLECT, ProfileCollector);
}
