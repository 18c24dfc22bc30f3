//! Service entry point: environment loading, startup validation, and the
//! engine lifecycle. The chat front-end is an external process speaking
//! through the engine's command API and [`Notifier`] boundary; this binary
//! wires a logging notifier so the engine runs standalone.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sitewatch::engine::{Engine, EngineConfig, Notifier};
use sitewatch::types::AlertEvent;

#[derive(Parser, Debug)]
#[command(name = "sitewatch", version)]
#[command(about = "Multi-tenant website-change monitoring service")]
struct Cli {
    /// Path of the persistence file.
    #[arg(long, default_value = "sitewatch.json")]
    db: PathBuf,

    /// Seconds between patrol cycles.
    #[arg(long, default_value_t = 60)]
    patrol_interval: u64,

    /// Skip robots.txt checks (testing only).
    #[arg(long)]
    ignore_robots: bool,
}

/// Stand-in delivery sink: logs every outbound event. A chat front-end
/// replaces this with its own [`Notifier`].
struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, chat_id: i64, event: &AlertEvent) {
        match event {
            AlertEvent::ChangeDetected {
                url,
                change_type,
                similarity_final,
                ..
            } => tracing::info!(chat_id, url = %url, change = %change_type, similarity = similarity_final, "change alert"),
            AlertEvent::HostCooldown {
                host,
                retry_after_seconds,
            } => tracing::warn!(chat_id, host = %host, retry_after_seconds, "host cooldown"),
            AlertEvent::Diagnostic { url, message } => {
                tracing::warn!(chat_id, url = ?url, message = %message, "diagnostic")
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let token = std::env::var("TELEGRAM_TOKEN")
        .context("TELEGRAM_TOKEN is required (bearer token for the chat front-end)")?;
    if token.trim().is_empty() {
        bail!("TELEGRAM_TOKEN is set but empty");
    }

    let admin_chat_id = match std::env::var("ADMIN_ID") {
        Ok(raw) => Some(
            raw.trim()
                .parse::<i64>()
                .with_context(|| format!("ADMIN_ID must be a chat id, got {raw:?}"))?,
        ),
        Err(_) => None,
    };

    // Reserved for a future health endpoint.
    let _port = std::env::var("PORT").ok();

    sitewatch::store::startup_disk_guard(&cli.db)
        .context("refusing to start without headroom on the database volume")?;

    let mut config = EngineConfig::new(cli.db);
    config.patrol_interval = Duration::from_secs(cli.patrol_interval.max(1));
    config.admin_chat_id = admin_chat_id;
    config.request.respect_robots = !cli.ignore_robots;

    let engine = Engine::open(config, Arc::new(LogNotifier)).context("engine startup failed")?;
    engine.start();
    tracing::info!("sitewatch running; ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    engine.stop().await.context("shutdown failed")?;
    Ok(())
}
