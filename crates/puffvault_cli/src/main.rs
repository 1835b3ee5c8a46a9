//! Thin CLI bootstrap for the migration pipeline.
//!
//! Loads `.env` and TOML configuration, wires the real (or in-memory)
//! collaborators into the core `Migrator`, and prints the end-of-run
//! summary. A non-zero failure count does not fail the process; only setup
//! failures do.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use owo_colors::OwoColorize;
use tracing::info;

use puffvault_core::{
    HttpVaultClient, IdentityStore, Keypair, MemoryIdentityStore, MemoryVault, MigrationConfig,
    Migrator, PgIdentityStore, RecordSource, SourceDb, VaultStore,
};

#[derive(Parser)]
#[command(name = "puffvault")]
#[command(about = "Migrate puff records into per-owner private vaults")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration to completion
    Migrate {
        /// Read from the source but upload to in-memory stores; nothing
        /// reaches the vault network
        #[arg(long)]
        dry_run: bool,

        /// Override the configured batch size
        #[arg(long)]
        batch_size: Option<i64>,

        /// Start cursor (overrides config; a state file still wins)
        #[arg(long)]
        start_cursor: Option<i64>,

        /// Exclusive upper bound on source ids
        #[arg(long)]
        stop_cursor: Option<i64>,
    },
    /// Report source counts and provisioned identities
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    init_tracing(cli.debug);

    let mut config = MigrationConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Migrate {
            dry_run,
            batch_size,
            start_cursor,
            stop_cursor,
        } => {
            if let Some(batch_size) = batch_size {
                config.run.batch_size = batch_size;
            }
            if let Some(start_cursor) = start_cursor {
                config.run.start_cursor = start_cursor;
            }
            if let Some(stop_cursor) = stop_cursor {
                config.run.stop_cursor = Some(stop_cursor);
            }
            migrate(config, dry_run).await
        }
        Commands::Status => status(config).await,
    }
}

async fn migrate(mut config: MigrationConfig, dry_run: bool) -> Result<()> {
    if dry_run && config.vault.operator_key.is_empty() {
        // Dry runs don't need a real credential; mint a throwaway one.
        config.vault.operator_key = Keypair::generate().secret_hex();
    }
    config.validate()?;

    let source = Arc::new(SourceDb::connect(&config.source).await?);

    let (vault, identity_store): (Arc<dyn VaultStore>, Arc<dyn IdentityStore>) = if dry_run {
        info!("dry run: using in-memory vault and identity stores");
        let operator = Keypair::from_hex(&config.vault.operator_key)?;
        (
            Arc::new(MemoryVault::new(operator.did())),
            Arc::new(MemoryIdentityStore::new()),
        )
    } else {
        let vault = HttpVaultClient::new(
            config.vault.nodes.clone(),
            config.vault.operator_key.clone(),
        )?;
        let identity_store = PgIdentityStore::new(source.pool().clone());
        identity_store.ensure_table().await?;
        (Arc::new(vault), Arc::new(identity_store))
    };

    let migrator = Migrator::new(config, source.clone(), vault, identity_store)?;
    let summary = migrator.run().await?;
    source.close().await;

    println!("\n{}", "Migration complete".green().bold());
    println!("{summary}");
    // Record-level failures are reported, not fatal.
    Ok(())
}

async fn status(config: MigrationConfig) -> Result<()> {
    config.validate()?;

    let source = Arc::new(SourceDb::connect(&config.source).await?);
    let identity_store = PgIdentityStore::new(source.pool().clone());
    identity_store.ensure_table().await?;

    let total = source.count_total().await?;
    let start_cursor = resolved_cursor(&config).into_diagnostic()?;
    let remaining = source
        .count_remaining(start_cursor, config.run.stop_cursor)
        .await?;
    let identities = identity_store.count().await?;
    source.close().await;

    println!("{}", "Migration status".bold());
    println!("source records:          {total}");
    println!("cursor:                  {start_cursor}");
    println!("remaining in window:     {remaining}");
    println!("identities provisioned:  {identities}");
    Ok(())
}

/// The cursor a run would actually start from: the persisted state file
/// when present, the configured start cursor otherwise.
fn resolved_cursor(config: &MigrationConfig) -> std::io::Result<i64> {
    let Some(path) = &config.run.state_file else {
        return Ok(config.run.start_cursor);
    };
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str::<puffvault_core::ProgressState>(&contents)
            .map(|state| state.cursor)
            .unwrap_or(config.run.start_cursor)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(config.run.start_cursor),
        Err(e) => Err(e),
    }
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = if debug {
        EnvFilter::new("puffvault_core=debug,puffvault=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("puffvault_core=info,puffvault=info,warn"))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .init();
}
