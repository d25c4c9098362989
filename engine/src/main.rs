use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use agenterm_core::{ConfigStore, Storage};
use agenterm_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use agenterm_server::{serve, AppState};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "agenterm-engine")]
#[command(about = "Headless AgenTerm supervisory runtime")]
struct Cli {
    #[arg(long, global = true, env = "AGENTERM_DATA_DIR", default_value = ".agenterm")]
    data_dir: PathBuf,

    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize config/observability, open the store, run pending
    /// migrations, start the event-trigger loop and bind the HTTP router.
    Serve {
        #[arg(long, env = "AGENTERM_BIND", default_value = "127.0.0.1:39731")]
        bind: String,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Open the store, apply pending migrations, print the resulting schema
    /// version, exit.
    Migrate {
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Load config, open the store read-only, report effective
    /// configuration and schema version without mutating anything.
    Check {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    std::env::set_var("RUST_LOG", &cli.log_level);

    let logs_dir = canonical_logs_dir_from_root(&cli.data_dir);
    let _guard = init_process_logging(ProcessKind::Engine, &logs_dir, 14).ok();

    match cli.command {
        Command::Serve { bind, db, config } => {
            let addr: SocketAddr = bind.parse().context("invalid --bind address")?;
            tokio::fs::create_dir_all(&cli.data_dir).await?;
            if let Some(config_path) = &config {
                std::env::set_var("AGENTERM_GLOBAL_CONFIG", config_path);
            }
            let state =
                AppState::bootstrap_with_paths(&cli.data_dir, format!("http://{addr}"), db, config)
                    .await?;
            info!("starting agenterm-engine on http://{addr}");
            serve(addr, state).await?;
        }
        Command::Migrate { db } => {
            let db_path = db.unwrap_or_else(|| cli.data_dir.join("agenterm.sqlite3"));
            let storage = Storage::open(&db_path).await?;
            let version = storage.schema_version().await?;
            println!("schema version: {version}");
        }
        Command::Check { db, config } => {
            let db_path = db.unwrap_or_else(|| cli.data_dir.join("agenterm.sqlite3"));
            let config_path = config.unwrap_or_else(|| cli.data_dir.join("config.json"));
            let config_store = ConfigStore::new(&config_path, None).await?;
            let effective = config_store.get_effective_value().await;
            let storage = Storage::open(&db_path).await?;
            let version = storage.schema_version().await?;
            println!("schema version: {version}");
            println!("{}", serde_json::to_string_pretty(&effective)?);
        }
    }

    Ok(())
}
