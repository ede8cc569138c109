//! Portico - custom domains with automatic HTTPS
//!
//! Runs the control plane (verification, certificates, proxy reconciliation)
//! behind an admin HTTP API.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portico_api::{ApiServer, ApiServerConfig};
use portico_cert::SecretCipher;
use portico_control::{ControlPlane, Settings};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

const LONG_VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Portico - custom domains with automatic HTTPS
#[derive(Parser, Debug)]
#[command(name = "portico")]
#[command(about = "Portico - custom domains with automatic HTTPS")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, env = "PORTICO_CONFIG", default_value = "portico.yml")]
    config: PathBuf,

    /// Database URL (overrides the settings file)
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Base64 master key sealing certificate keys and provider tokens
    #[arg(long, global = true, env = "PORTICO_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the API, reconciler and scheduler until Ctrl+C
    #[command(long_about = r#"
Run the control plane: apply migrations, seed the proxy state from the live
configuration, then serve the admin API while the reconciler and scheduler
run in the background. Ctrl+C lets the running reconciliation cycle finish
before exiting.

EXAMPLES:
  # Development with self-signed certificates
  PORTICO_MASTER_KEY=$(portico generate-key) portico serve

  # Custom settings file and bind address
  portico --config /etc/portico/portico.yml serve --bind 0.0.0.0:8470

ENVIRONMENT VARIABLES:
  PORTICO_CONFIG        Settings file
  DATABASE_URL          Database URL
  PORTICO_MASTER_KEY    Base64 master key
  PORTICO_ADMIN_TOKEN   Bearer token required by the API
    "#)]
    Serve {
        /// API bind address (overrides the settings file)
        #[arg(long, env = "PORTICO_BIND")]
        bind: Option<SocketAddr>,

        /// Bearer token required by the API (overrides the settings file)
        #[arg(long, env = "PORTICO_ADMIN_TOKEN", hide_env_values = true)]
        admin_token: Option<String>,
    },

    /// Apply database migrations and exit
    Migrate,

    /// Print the proxy configuration the current database produces
    Render,

    /// Print a new random master key
    GenerateKey,
}

/// Setup logging; RUST_LOG wins over `log_level`
fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    if let Some(url) = &cli.database_url {
        settings.database_url = url.clone();
    }
    if let Some(key) = &cli.master_key {
        settings.master_key = Some(key.clone());
    }
    Ok(settings)
}

async fn serve(
    mut settings: Settings,
    bind: Option<SocketAddr>,
    admin_token: Option<String>,
) -> Result<()> {
    if let Some(bind) = bind {
        settings.api.bind = bind.to_string();
    }
    if admin_token.is_some() {
        settings.api.admin_token = admin_token;
    }
    let bind_addr: SocketAddr = settings
        .api
        .bind
        .parse()
        .with_context(|| format!("Invalid API bind address '{}'", settings.api.bind))?;
    let api_config = ApiServerConfig {
        bind_addr,
        enable_cors: false,
        admin_token: settings.api.admin_token.clone(),
    };

    let plane = ControlPlane::from_settings(settings)
        .await
        .context("Failed to initialize control plane")?;
    plane
        .start()
        .await
        .context("Failed to start control plane")?;

    let shutdown = CancellationToken::new();
    let api = ApiServer::new(api_config, plane.clone());
    let api_handle = tokio::spawn(api.start(shutdown.clone().cancelled_owned()));

    info!("Portico is running on {}", bind_addr);
    info!("Press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    shutdown.cancel();
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("API server error: {:#}", e),
        Err(e) => error!("API server task failed: {}", e),
    }
    plane.shutdown().await;

    info!("Portico stopped");
    Ok(())
}

async fn migrate(settings: &Settings) -> Result<()> {
    let db = portico_db::connect(&settings.database_url)
        .await
        .context("Failed to connect to database")?;
    portico_db::migrate(&db)
        .await
        .context("Failed to apply migrations")?;
    Ok(())
}

async fn render(settings: Settings) -> Result<()> {
    let plane = ControlPlane::from_settings(settings)
        .await
        .context("Failed to initialize control plane")?;
    let generated = plane
        .render_config()
        .await
        .context("Failed to render proxy configuration")?;
    for excluded in &generated.excluded {
        warn!(domain = %excluded.name, reason = %excluded.reason, "Domain excluded");
    }
    print!("{}", generated.text);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match &cli.command {
        Commands::GenerateKey => {
            println!("{}", SecretCipher::generate_key()?);
            Ok(())
        }
        Commands::Migrate => migrate(&load_settings(&cli)?).await,
        Commands::Render => render(load_settings(&cli)?).await,
        Commands::Serve { bind, admin_token } => {
            serve(load_settings(&cli)?, *bind, admin_token.clone()).await
        }
    }
}
