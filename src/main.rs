mod workflows;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use skein_engine::coordinator::SweepConfig;
use skein_engine::registry::WorkflowRegistry;
use skein_server::{HandlerState, ServerConfig};
use skein_store::Database;
use skein_telemetry::{LogFormat, TelemetryConfig};

#[derive(Parser)]
#[command(name = "skein", version, about = "Workflow execution and session coordination server")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 9085)]
    port: u16,

    /// SQLite database path. Defaults to ~/.skein/skein.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long)]
    json_logs: bool,

    /// Seconds between background sweep passes.
    #[arg(long, default_value_t = 60)]
    sweep_interval: u64,

    /// Idle seconds after which an active session is expired.
    #[arg(long, default_value_t = 86_400)]
    session_ttl: i64,

    /// Silent seconds after which a stale connection row is pruned.
    #[arg(long, default_value_t = 300)]
    connection_ttl: i64,
}

fn default_db_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".skein").join("skein.db"))
        .unwrap_or_else(|| PathBuf::from("skein.db"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    let _telemetry = skein_telemetry::init(&TelemetryConfig {
        log_level,
        format: if cli.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
        ..Default::default()
    })?;

    let db_path = cli.db.unwrap_or_else(default_db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database ready");

    let registry = Arc::new(WorkflowRegistry::new());
    workflows::register_builtin(&registry);
    tracing::info!(modes = ?registry.modes(), "workflow modes registered");

    let handler_state = Arc::new(HandlerState::new(db, registry));

    let shutdown = CancellationToken::new();
    let sweep = handler_state.coordinator.spawn_sweep(
        Arc::clone(&handler_state.channels),
        SweepConfig {
            interval_secs: cli.sweep_interval,
            session_ttl_secs: cli.session_ttl,
            connection_ttl_secs: cli.connection_ttl,
            ..Default::default()
        },
        shutdown.clone(),
    );

    let server = skein_server::start(
        ServerConfig {
            port: cli.port,
            ..Default::default()
        },
        handler_state,
    )
    .await
    .context("start server")?;
    tracing::info!(port = server.port, "listening");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    shutdown.cancel();
    let _ = sweep.await;

    Ok(())
}
