use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use recap_config::{AppConfig, ConfigLoader};
use recap_db::{
    backup_if_plaintext, migrate_to_encrypted, EncryptedStore, KeyManager, MigrateOptions,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "recap", version, about = "Recap - chat group summarization")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Config directory override
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config/data directories and the database key
    Init,

    /// Show stored groups with message and summary counts
    Status,

    /// Copy an unencrypted database into a freshly keyed encrypted one
    Migrate {
        /// Path to the unencrypted source database
        #[arg(long)]
        source: PathBuf,

        /// Path for the encrypted destination database
        #[arg(long)]
        dest: PathBuf,

        /// Skip the post-copy row-count verification
        #[arg(long)]
        no_verify: bool,

        /// Byte-copy the source to a timestamped backup before migrating
        #[arg(long)]
        backup: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let loader = match cli.config_dir.clone() {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new()?,
    };
    let config = loader.load()?;

    match cli.command {
        Commands::Init => cmd_init(&loader, &config),
        Commands::Status => cmd_status(&loader, &config).await,
        Commands::Migrate {
            source,
            dest,
            no_verify,
            backup,
        } => cmd_migrate(&loader, &config, &source, &dest, no_verify, backup),
    }
}

fn key_manager(loader: &ConfigLoader, config: &AppConfig) -> KeyManager {
    KeyManager::new(
        config.database.secret_file.clone(),
        loader.key_file_path(config),
    )
}

fn cmd_init(loader: &ConfigLoader, config: &AppConfig) -> Result<()> {
    loader.ensure_dirs(config)?;
    key_manager(loader, config)
        .load_or_create()
        .context("failed to set up the database key")?;

    println!("Config dir: {}", loader.config_dir().display());
    println!("Database:   {}", loader.db_path(config).display());
    println!("Key file:   {}", loader.key_file_path(config).display());
    Ok(())
}

async fn cmd_status(loader: &ConfigLoader, config: &AppConfig) -> Result<()> {
    loader.ensure_dirs(config)?;
    let key = key_manager(loader, config).load_or_create()?;

    let db_path = loader.db_path(config);
    if let Some(backup) = backup_if_plaintext(&db_path)? {
        println!(
            "Found an unencrypted database, moved it to {}",
            backup.display()
        );
        println!("Run `recap migrate` to import it into the encrypted store.");
    }

    let store = EncryptedStore::open(&db_path, &key)?;
    store.init()?;

    let groups = store.list_group_ids().await?;
    if groups.is_empty() {
        println!("No groups stored yet.");
        return Ok(());
    }

    println!("{:<24} {:>10} {:>10}", "group", "messages", "summaries");
    for group_id in &groups {
        let messages = store.message_count_sync(group_id)?;
        let summaries = store.summary_count_sync(group_id)?;
        println!("{group_id:<24} {messages:>10} {summaries:>10}");
    }
    Ok(())
}

fn cmd_migrate(
    loader: &ConfigLoader,
    config: &AppConfig,
    source: &PathBuf,
    dest: &PathBuf,
    no_verify: bool,
    backup: bool,
) -> Result<()> {
    let key = key_manager(loader, config)
        .load_or_create()
        .context("failed to resolve the destination key")?;

    let options = MigrateOptions {
        verify: !no_verify,
        backup,
    };
    let report = migrate_to_encrypted(source, dest, &key, &options)?;
    report.print_summary();
    Ok(())
}
