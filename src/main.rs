mod config;
mod control;
mod db;
mod engine;
mod models;
mod service;

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

#[derive(Parser)]
#[command(
    name = "uplink",
    version,
    about = "Watch a directory tree and keep it uploaded over SFTP"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "uplink.toml")]
    config: PathBuf,

    /// Re-queue files whose last status change is at or after this UTC
    /// timestamp, e.g. "2023-01-01 00:00:00". One-shot; exits afterwards.
    #[arg(long, value_name = "START", requires = "requeue_end")]
    requeue_start: Option<String>,

    /// Upper bound of the re-queue window, same format as --requeue-start.
    #[arg(long, value_name = "END", requires = "requeue_start")]
    requeue_end: Option<String>,

    /// Re-queue a single file by its path relative to the source root.
    /// One-shot; exits afterwards.
    #[arg(long, value_name = "FILENAME", conflicts_with_all = ["requeue_start", "requeue_end"])]
    requeue: Option<String>,

    /// Seconds to wait before a single-file re-queue takes effect.
    #[arg(long, value_name = "SECONDS", requires = "requeue")]
    delay: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&config);

    if let Some(path) = cli.requeue {
        let db = db::DbHandle::open(&config.db_path)
            .await
            .context("cannot open state store")?;
        control::requeue_file(&db, &config, &path, cli.delay).await?;
        return Ok(());
    }

    if let (Some(start), Some(end)) = (cli.requeue_start, cli.requeue_end) {
        let start = control::parse_timestamp(&start)?;
        let end = control::parse_timestamp(&end)?;
        let db = db::DbHandle::open(&config.db_path)
            .await
            .context("cannot open state store")?;
        let requeued = control::requeue_range(&db, &config, start, end).await?;
        println!("re-queued {requeued} files");
        return Ok(());
    }

    service::run(config).await
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file_appender = tracing_appender::rolling::never(dir, "uplink.log");
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}
