mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use mist_core::DatabaseGateway;
use mist_import::ImportEngine;
use mist_mail::{Connector, CredentialStore, ImapConnector, MailSource};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "mist", version, about = "Imports mail into a donor history store")]
struct Cli {
    /// Log level (overrides the config file; RUST_LOG overrides both).
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import messages from the configured sources.
    Import(ImportCmd),
    /// Create a new, empty target store.
    InitStore(InitStoreCmd),
    /// Run a source's sign-in without importing, caching OAuth tokens.
    Auth(AuthCmd),
}

#[derive(Args, Debug)]
struct ImportCmd {
    /// Target store (overrides `[store] path`).
    #[arg(long)]
    db: Option<PathBuf>,
    /// Roll back every message instead of committing.
    #[arg(long)]
    dry_run: bool,
    /// Only import these sources, by name. Repeatable.
    #[arg(long = "source")]
    sources: Vec<String>,
}

#[derive(Args, Debug)]
struct InitStoreCmd {
    #[arg(long)]
    db: PathBuf,
}

#[derive(Args, Debug)]
struct AuthCmd {
    #[arg(long)]
    source: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref())?;
    let data_dir = config::data_dir(&config);
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.general.log_level.clone());
    setup_logging(&level, &data_dir);

    let rt = tokio::runtime::Runtime::new()?;
    let result = match cli.command {
        Command::Import(cmd) => rt.block_on(cmd_import(&config, cmd, &data_dir)),
        Command::InitStore(cmd) => rt.block_on(cmd_init_store(&cmd.db)),
        Command::Auth(cmd) => rt.block_on(cmd_auth(&config, &cmd.source, &data_dir)),
    };
    // Mail workers of timed-out sources may still be blocked on the network.
    rt.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

fn setup_logging(level: &str, data_dir: &Path) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if std::fs::create_dir_all(data_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(data_dir, "mist.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

async fn cmd_import(config: &Config, cmd: ImportCmd, data_dir: &Path) -> Result<()> {
    let db_path = cmd
        .db
        .or_else(|| config.store.path.clone())
        .context("no target store given: pass --db or set [store] path")?;

    let mut db = DatabaseGateway::new();
    db.connect(&db_path)
        .await
        .with_context(|| format!("opening target store {}", db_path.display()))?;
    let commit = config.store.commit && !cmd.dry_run;
    db.set_commit_enabled(commit);
    if !commit {
        info!("Dry run: every message will be rolled back");
    }

    let credential_store = CredentialStore::new(data_dir);
    let connector: Arc<dyn Connector> = Arc::new(ImapConnector::default());
    let sources: Vec<MailSource> = config
        .select_sources(&cmd.sources)
        .into_iter()
        .map(|source| MailSource::from_config(source, connector.clone(), credential_store.clone()))
        .collect();

    let db = Arc::new(Mutex::new(db));
    let reports = ImportEngine::new(db.clone(), config.import_options())
        .run(sources)
        .await;

    for report in &reports {
        for message in &report.messages {
            println!("  {}", message);
        }
        println!("{}", report);
    }
    db.lock().await.disconnect().await;
    Ok(())
}

async fn cmd_init_store(path: &Path) -> Result<()> {
    let mut db = DatabaseGateway::new();
    db.create(path)
        .await
        .with_context(|| format!("creating target store {}", path.display()))?;
    db.disconnect().await;
    println!("Created target store {}", path.display());
    Ok(())
}

async fn cmd_auth(config: &Config, name: &str, data_dir: &Path) -> Result<()> {
    let source = config
        .source_named(name)
        .cloned()
        .ok_or_else(|| anyhow!("no source named '{}' in the configuration", name))?;
    let credential_store = CredentialStore::new(data_dir);
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut source = MailSource::from_config(source, Arc::new(ImapConnector::default()), credential_store);
        source.connect(false)?;
        source.disconnect();
        Ok(())
    })
    .await??;
    println!("Source '{}' signed in", name);
    Ok(())
}
