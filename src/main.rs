use std::path::{Path, PathBuf};
use std::sync::Arc;

use overseer::config::EngineConfig;
use overseer::engine::Engine;
use overseer::runner::command::{CommandBackend, CommandConfig};
use overseer::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let db_path =
        std::env::var("OVERSEER_DB_PATH").unwrap_or_else(|_| "overseer.db".to_string());
    let data_dir: PathBuf = std::env::var("OVERSEER_DATA_DIR")
        .unwrap_or_else(|_| "overseer-data".to_string())
        .into();
    let runner_cmd = std::env::var("OVERSEER_RUNNER_CMD").unwrap_or_else(|_| {
        eprintln!("Error: OVERSEER_RUNNER_CMD not set");
        eprintln!("  export OVERSEER_RUNNER_CMD=/path/to/session-runner");
        std::process::exit(1);
    });

    eprintln!("🕰️  Overseer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   DB: {db_path}");
    eprintln!("   Data: {}", data_dir.display());
    eprintln!("   Runner: {runner_cmd}");

    let backend = Arc::new(LibSqlBackend::new_local(Path::new(&db_path)).await?);

    let mut config = EngineConfig::default();
    config.data_dir = data_dir.clone();

    let session_backend = Arc::new(CommandBackend::new(CommandConfig {
        program: runner_cmd,
        args: Vec::new(),
        session_root: data_dir.join("sessions"),
    }));

    let engine = Engine::new(config, backend, session_backend, None);
    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down...");
    engine.shutdown().await;
    Ok(())
}
