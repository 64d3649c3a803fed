//! Parley CLI
//!
//! Administrative commands for conversation state plus a console connector
//! for talking to the sample dialogs.

use parley_core::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
