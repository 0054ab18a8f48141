//! Main entry point for the Souk CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use dotenv::dotenv;

mod commands;
mod logging;

/// Souk CLI
#[derive(Parser)]
#[command(name = "souk")]
#[command(about = "Command-line client for the Souk realtime layer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Subcommands for the Souk CLI
#[derive(Subcommand)]
enum Commands {
    /// Follow a scope live and print every change and link-state transition
    Watch(commands::watch::WatchArgs),

    /// Show unread counts per conversation and, optionally, follow notifications
    Inbox(commands::inbox::InboxArgs),

    /// Mark every message in a conversation read for a user
    MarkRead(commands::receipts::MarkReadArgs),

    /// Send a message into a conversation
    Send(commands::send::SendArgs),

    /// Run the realtime layer against an in-memory backend and force a failover
    Demo(commands::demo::DemoArgs),

    /// Generate shell completion scripts for the CLI
    Completion {
        /// The shell type for which to generate the completion script (e.g., bash, zsh, fish, powershell)
        #[arg(long, short, value_enum)]
        shell: Shell,
    },

    /// Generate a configuration file
    Config {
        /// Format of the configuration file to generate (yaml or json). Defaults to yaml.
        #[arg(
            long,
            short,
            help = "Format of the configuration file to generate (yaml or json). Defaults to yaml."
        )]
        format: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch(args) => commands::watch::run(args).await?,
        Commands::Inbox(args) => commands::inbox::run(args).await?,
        Commands::MarkRead(args) => commands::receipts::run(args).await?,
        Commands::Send(args) => commands::send::run(args).await?,
        Commands::Demo(args) => commands::demo::run(args).await?,
        Commands::Completion { shell } => commands::completion::generate_completion(shell),
        Commands::Config { format } => {
            let format = format.unwrap_or_else(|| "yaml".to_string());
            commands::config::generate_config(&format)?;
        }
    }

    Ok(())
}
