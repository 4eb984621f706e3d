use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use foreman::api::{self, AppState};
use foreman::config::{ForemanConfig, ZombieMode};
use foreman::store::{Database, LibSqlBackend};
use foreman::zombie::{ZombieControl, ZombieDetector, spawn_zombie_detector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ForemanConfig::from_env().context("invalid configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing(&config);

    eprintln!("🛠  Foreman v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Worktrees: {}", config.worktree_root.display());
    eprintln!("   API: http://0.0.0.0:{}/api", config.http_port);
    eprintln!(
        "   Zombie scan: every {}s ({})",
        config.zombie.scan_interval.as_secs(),
        match config.zombie.mode {
            ZombieMode::Auto => "auto-kill",
            ZombieMode::Supervised => "supervised",
        }
    );
    if config.operator_token.is_none() {
        eprintln!("   Warning: FOREMAN_OPERATOR_TOKEN not set, operator routes are open");
    }

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .context("opening database")?,
    );

    let control = ZombieControl::new(Arc::clone(&db));
    let detector = Arc::new(ZombieDetector::new(
        Arc::clone(&db),
        control.clone(),
        config.zombie.clone(),
    ));
    let _detector_handle = spawn_zombie_detector(detector, config.zombie.scan_interval);

    let state = AppState::new(Arc::clone(&db), &config).with_control(control);
    let app = api::routes(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("binding port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "Operator API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .context("serving operator API")?;

    eprintln!("Goodbye!");
    Ok(())
}

fn init_tracing(config: &ForemanConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "foreman.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
