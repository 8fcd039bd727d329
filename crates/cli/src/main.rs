//! kiln CLI, the main entry point.
//!
//! Commands:
//! - `serve`    Start the HTTP service
//! - `status`   Show the resolved configuration
//! - `doctor`   Diagnose config, database, and model setup
//! - `config`   Validate, show, or locate the config file
//! - `onboard`  Write a default config file
//! - `store`    Inspect the conversation store

use clap::{Parser, Subcommand};
use kiln_config::{AppConfig, LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "kiln",
    about = "kiln: single-flight LLM generation with stored conversation context",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Serve {
        /// Override the bind address
        #[arg(long)]
        host: Option<String>,

        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Load this model (path or preset alias) at startup
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Show the resolved configuration
    Status,

    /// Diagnose config, database, and model setup
    Doctor,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Write a default config file
    Onboard,

    /// Inspect the conversation store
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Parse and validate the config file
    Validate,
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path
    Path,
}

#[derive(Subcommand)]
enum StoreAction {
    /// Conversation, message, and injection counts
    Stats,
    /// Most recently updated conversations
    List {
        /// Maximum rows to print
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

fn init_tracing(verbose: bool, logging: &LoggingConfig) {
    // RUST_LOG wins; otherwise --verbose, otherwise the configured level.
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let logging = AppConfig::load()
        .map(|c| c.logging)
        .unwrap_or_default();
    init_tracing(cli.verbose, &logging);

    match cli.command {
        Commands::Serve { host, port, model } => commands::serve::run(host, port, model).await?,
        Commands::Status => commands::status::run().await?,
        Commands::Doctor => commands::doctor::run().await?,
        Commands::Config { action } => match action {
            ConfigAction::Validate => commands::config_cmd::validate().await?,
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Store { action } => match action {
            StoreAction::Stats => commands::store_cmd::stats().await?,
            StoreAction::List { limit } => commands::store_cmd::list(limit).await?,
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_serve_overrides() {
        let cli = Cli::try_parse_from(["kiln", "serve", "--port", "9000", "-m", "tinyllama"]).unwrap();
        match cli.command {
            Commands::Serve { host, port, model } => {
                assert_eq!(host, None);
                assert_eq!(port, Some(9000));
                assert_eq!(model.as_deref(), Some("tinyllama"));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn parses_nested_subcommands() {
        let cli = Cli::try_parse_from(["kiln", "-v", "store", "list", "--limit", "5"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Store {
                action: StoreAction::List { limit: 5 }
            }
        ));
        assert!(Cli::try_parse_from(["kiln", "config", "nope"]).is_err());
    }
}
