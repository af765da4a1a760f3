use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tether_core::{telemetry, ApiClient, ClientSettings};
use tokio::runtime::Runtime;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Command-line client for the management API")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// API base URL; overrides tether.yaml.
    #[arg(long, env = "TETHER_API_URL", global = true)]
    url: Option<String>,
    /// Explicit path to a tether.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, short, env = "TETHER_USERNAME", global = true)]
    username: Option<String>,
    #[arg(long, env = "TETHER_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the credentials and report the signed-in user.
    Login,
    /// Log in and print the authenticated user.
    Whoami,
    /// GET an API path and print the JSON response.
    Get { path: String },
    /// Print host information.
    Info,
    /// Follow the live stats stream.
    Stats {
        /// Exit after this many samples.
        #[arg(long)]
        samples: Option<usize>,
    },
}

fn main() -> Result<()> {
    telemetry::init_tracing(telemetry::env_filter_or_default())?;
    let cli = Cli::parse();

    let settings = resolve_settings(&cli)?;
    let runtime = Runtime::new()?;
    runtime.block_on(run(cli, settings))
}

fn resolve_settings(cli: &Cli) -> Result<ClientSettings> {
    let mut settings = match (&cli.url, &cli.config) {
        (Some(url), _) => ClientSettings::parse(url),
        (None, Some(path)) => ClientSettings::from_path(path),
        (None, None) => ClientSettings::load(),
    }
    .map_err(|err| anyhow::anyhow!(err.user_message()))?;
    if let Some(username) = &cli.username {
        settings.username = Some(username.clone());
    }
    Ok(settings)
}

async fn run(cli: Cli, settings: ClientSettings) -> Result<()> {
    let client = ApiClient::new(settings).context("failed to build HTTP client")?;
    commands::authenticate(&client, cli.password.as_deref()).await?;

    let outcome = match cli.command {
        Command::Login => commands::login(&client),
        Command::Whoami => commands::whoami(&client).await,
        Command::Get { path } => commands::get(&client, &path).await,
        Command::Info => commands::info(&client).await,
        Command::Stats { samples } => commands::stats(&client, samples).await,
    };

    client.logout().await;
    outcome
}
