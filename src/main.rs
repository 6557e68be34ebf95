use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use switchboard::channels::{NullLabelClient, WhatsAppTransport};
use switchboard::config::Config;
use switchboard::engine::Engine;
use switchboard::gateway;
use switchboard::observability::TracingObserver;
use switchboard::providers::OpenAiCompatibleGenerator;
use switchboard::store::SqliteStore;

#[derive(Parser)]
#[command(name = "switchboard", version, about = "Conversational-automation gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook ingest server and reconciliation engine
    Run {
        /// Override the configured listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Inspect or initialize configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the active configuration (secrets redacted)
    Show,
    /// Write a default config.toml if none exists
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { port } => run(port).await,
        Commands::Config { command } => match command {
            ConfigCommands::Show => config_show(),
            ConfigCommands::Init => config_init(),
        },
    }
}

async fn run(port_override: Option<u16>) -> Result<()> {
    let mut config = Config::load_or_init()?;
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    let store = Arc::new(SqliteStore::open(
        &config.storage.resolve_path(&config.workspace_dir),
    )?);

    let whatsapp = config
        .channels_config
        .whatsapp
        .clone()
        .unwrap_or_default();
    let transport = Arc::new(WhatsAppTransport::new(whatsapp));
    let generator = Arc::new(OpenAiCompatibleGenerator::new(&config.generator));

    let engine = Arc::new(Engine::new(
        config.engine.clone(),
        config.handover.clone(),
        store.clone(),
        store.clone(),
        store,
        transport,
        Arc::new(NullLabelClient),
        generator,
        Arc::new(TracingObserver),
    ));

    let cancel = CancellationToken::new();
    engine.spawn_maintenance(cancel.clone());

    let serve = gateway::serve(&config, engine);
    tokio::select! {
        result = serve => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            cancel.cancel();
        }
    }
    Ok(())
}

fn config_show() -> Result<()> {
    let mut config = Config::load_or_init()?;
    if let Some(whatsapp) = config.channels_config.whatsapp.as_mut() {
        if !whatsapp.access_token.is_empty() {
            whatsapp.access_token = "***".into();
        }
        if !whatsapp.webhook_secret.is_empty() {
            whatsapp.webhook_secret = "***".into();
        }
    }
    if let Some(key) = config.generator.api_key.as_mut() {
        *key = "***".into();
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn config_init() -> Result<()> {
    let config = Config::load_or_init()?;
    println!("config at {}", config.config_path.display());
    Ok(())
}
