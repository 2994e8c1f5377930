pub mod commands;
pub mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cli::config::ScraperConfig;
use crate::utils::{init_logging, mode_log_file};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Mode to run
    #[arg(short, long, required_unless_present = "list")]
    pub mode: Option<String>,

    /// Use this URL as the only input record instead of the input mode's output
    #[arg(short, long, conflicts_with = "chain")]
    pub url: Option<String>,

    /// Run the modes this one reads from first
    #[arg(long)]
    pub chain: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// List available modes and exit
    #[arg(short, long)]
    pub list: bool,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

fn load_config(path: Option<&Path>) -> Result<ScraperConfig> {
    match path {
        Some(path) => ScraperConfig::load_from_file(path),
        None => ScraperConfig::load_default().context("Failed to load default configuration"),
    }
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    let log_file = match &cli.mode {
        Some(mode) if config.logging.file_logging => {
            Some(mode_log_file(&config.logging.directory, mode))
        }
        _ => None,
    };
    init_logging(cli.verbose, log_file)?;
    info!("Starting relay v{}", env!("CARGO_PKG_VERSION"));

    let registry = commands::build_registry(&config)?;

    if cli.list {
        return commands::list_modes(&registry);
    }

    let mode = cli.mode.context("No mode given")?;
    if cli.chain {
        info!("Running chain for mode {}", mode);
        commands::run_chain(registry, &config, &mode).await
    } else {
        info!("Running mode {}", mode);
        commands::run_mode(registry, &config, &mode, cli.url.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_mode_required_unless_listing() {
        assert!(Cli::try_parse_from(["relay"]).is_err());
        assert!(Cli::try_parse_from(["relay", "--list"]).is_ok());

        let cli = Cli::try_parse_from(["relay", "--mode", "links", "--url", "https://example.com"]).unwrap();
        assert_eq!(cli.mode.as_deref(), Some("links"));
        assert_eq!(cli.url.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn test_url_conflicts_with_chain() {
        let parsed = Cli::try_parse_from(["relay", "--mode", "pages", "--chain", "--url", "https://example.com"]);
        assert!(parsed.is_err());
    }
}
