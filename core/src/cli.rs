use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogConfig, StorageBackend, CONFIG_PATH_ENV, DATABASE_URL_ENV};
use crate::db;
use crate::dispatch::{DispatchError, Dispatcher, InboundEvent, TurnOutcome};
use crate::engine::DialogRegistry;
use crate::message::StdoutSink;
use crate::routing::Matcher;
use crate::samples;
use crate::state::{ConversationIdentity, Partition};
use crate::store::{InMemoryStateStore, PgStateStore, StateStore};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley - resumable dialog stacks for conversational agents", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which conversation a command applies to
#[derive(Args, Debug, Clone)]
pub struct IdentityArgs {
    #[arg(long, default_value = "console")]
    pub channel: String,

    #[arg(long, default_value = "console")]
    pub conversation: String,

    #[arg(long, default_value = "me")]
    pub user: String,
}

impl IdentityArgs {
    fn identity(&self) -> ConversationIdentity {
        ConversationIdentity::new(&self.channel, &self.conversation, &self.user)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run database migrations
    Migrate,

    /// Print the effective configuration as TOML
    Config,

    /// Show the stored state of a conversation
    Inspect {
        #[command(flatten)]
        identity: IdentityArgs,
    },

    /// List stored keys of a partition (Postgres only)
    List {
        /// Partition: user, conversation, private
        #[arg(short = 'p', long = "partition", default_value = "private")]
        partition: String,

        /// Number of results (default: 20)
        #[arg(short = 'l', long = "limit", default_value = "20")]
        limit: i64,
    },

    /// Forget the dialog stack of a conversation; user and conversation data are kept
    Reset {
        #[command(flatten)]
        identity: IdentityArgs,

        /// Skip confirmation prompt
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },

    /// Talk to the sample dialogs from the terminal
    Chat {
        #[command(flatten)]
        identity: IdentityArgs,
    },
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    use std::env;

    // Apply CLI overrides to environment before any database operations
    if let Some(config_path) = &cli.config {
        env::set_var(CONFIG_PATH_ENV, config_path);
    }
    if let Some(database_url) = &cli.database_url {
        env::set_var(DATABASE_URL_ENV, database_url);
    }

    // Eagerly load and validate configuration before executing any command
    let config = Config::load()?;
    init_tracing(&config.log);

    match cli.command {
        Commands::Migrate => {
            let pool = db::create_pool(&config.database).await?;
            println!("Running migrations...");
            db::migrate(&pool).await?;
            println!("Migrations complete!");
        }

        Commands::Config => {
            print!("{}", config.to_toml()?);
        }

        Commands::List { partition, limit } => {
            let Some(partition) = Partition::parse(&partition) else {
                bail!(
                    "Invalid partition: {}. Must be one of: user, conversation, private",
                    partition
                );
            };
            let store = PgStateStore::new(db::create_pool(&config.database).await?);
            let keys = store.list(partition, limit).await?;

            if keys.is_empty() {
                println!("No {} state found", partition);
                return Ok(());
            }
            println!("Found {} key(s):\n", keys.len());
            for (key, updated_at) in keys {
                println!("  {} | {}", updated_at, key);
            }
        }

        Commands::Inspect { identity } => {
            with_store(&config, StoreCommand::Inspect(identity)).await?;
        }

        Commands::Reset { identity, yes } => {
            if !yes {
                eprintln!("Error: Confirmation required. Use --yes flag to confirm reset.");
                std::process::exit(1);
            }
            with_store(&config, StoreCommand::Reset(identity)).await?;
        }

        Commands::Chat { identity } => {
            with_store(&config, StoreCommand::Chat(identity)).await?;
        }
    }

    Ok(())
}

/// Log to stderr so chat output stays readable; `RUST_LOG` wins over the config
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    // Already installed when embedded in another binary
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// The sample dialog set wired the way `chat` runs it
pub fn sample_dispatcher<S: StateStore>(store: Arc<S>, config: &Config) -> Dispatcher<S> {
    let mut registry = DialogRegistry::new();
    samples::register(&mut registry);

    Dispatcher::new(
        store,
        Arc::new(StdoutSink),
        registry,
        config.dispatch.clone(),
    )
    .with_engine_config(config.engine)
    .with_interrupt(Matcher::exact("menu"), Some(samples::ROOT.to_string()))
}

/// Commands that go through a dispatcher
enum StoreCommand {
    Inspect(IdentityArgs),
    Reset(IdentityArgs),
    Chat(IdentityArgs),
}

async fn with_store(config: &Config, command: StoreCommand) -> Result<()> {
    match config.storage.backend {
        StorageBackend::Memory => {
            if !matches!(command, StoreCommand::Chat(_)) {
                warn!("In-memory storage is empty outside of a chat session");
            }
            run_with_store(Arc::new(InMemoryStateStore::new()), config, command).await
        }
        StorageBackend::Postgres => {
            let pool = db::create_pool(&config.database).await?;
            run_with_store(Arc::new(PgStateStore::new(pool)), config, command).await
        }
    }
}

async fn run_with_store<S: StateStore>(
    store: Arc<S>,
    config: &Config,
    command: StoreCommand,
) -> Result<()> {
    let dispatcher = sample_dispatcher(store, config);

    match command {
        StoreCommand::Inspect(identity) => {
            let snapshot = dispatcher.snapshot(&identity.identity()).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }

        StoreCommand::Reset(identity) => {
            let identity = identity.identity();
            if dispatcher.reset(&identity).await? {
                println!("✓ Conversation {} reset", identity);
            } else {
                println!("Conversation {} has no stored dialog state", identity);
            }
        }

        StoreCommand::Chat(identity) => chat(&dispatcher, identity.identity()).await?,
    }

    Ok(())
}

/// Console connector: one line of stdin is one inbound event
async fn chat<S: StateStore>(
    dispatcher: &Dispatcher<S>,
    identity: ConversationIdentity,
) -> Result<()> {
    println!("Chatting as {} (Ctrl-D to exit)", identity);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match dispatcher
            .handle(InboundEvent::text(identity.clone(), line))
            .await
        {
            Ok(TurnOutcome::Suspended { .. }) => {}
            Ok(TurnOutcome::Completed(_)) | Ok(TurnOutcome::Ended) => {
                println!("(conversation ended, say anything to start again)");
            }
            // The reply was already sent; the conversation starts over next time
            Err(DispatchError::Unhandled(error)) => {
                eprintln!("[{}] {}", error.code, error.message);
            }
            Err(e @ DispatchError::Conflict { .. }) => {
                eprintln!("Error: {}. Please repeat your last message.", e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
