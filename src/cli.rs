//! Command-line interface
//!
//! - `serve`: run the HTTP/WebSocket server (default)
//! - `check-config`: load and validate the layered configuration

use clap::{Args, Parser, Subcommand};

/// MarketFlow operation orchestration server
#[derive(Parser, Debug)]
#[command(name = "marketflow")]
#[command(about = "Operation orchestration engine for the MarketFlow data pipeline")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server (default)
    Serve(ServeArgs),
    /// Load the configuration and print the effective values
    CheckConfig,
}

/// Overrides for `serve`
#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Bind address (overrides server.host)
    #[arg(long)]
    pub host: Option<String>,
    /// Listen port (overrides server.port)
    #[arg(long)]
    pub port: Option<u16>,
}

/// Run the CLI command
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Serve(args)) => crate::server::run(args).await,
        Some(Commands::CheckConfig) => check_config(),
        None => crate::server::run(ServeArgs::default()).await,
    }
}

fn check_config() -> anyhow::Result<()> {
    let config = crate::server::load_config()?;
    crate::server::validate(&config)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!();
    println!("Configuration OK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from(["marketflow", "serve", "--host", "0.0.0.0", "--port", "9000"])
            .unwrap();
        match cli.command {
            Some(Commands::Serve(args)) => {
                assert_eq!(args.host.as_deref(), Some("0.0.0.0"));
                assert_eq!(args.port, Some(9000));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_check_config_subcommand() {
        let cli = Cli::try_parse_from(["marketflow", "check-config"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert!(Cli::try_parse_from(["marketflow"]).unwrap().command.is_none());
    }
}
