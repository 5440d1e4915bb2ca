use clap::Parser;
use quorum::cli::Cli;
use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let repo_path = match cli.repo.clone() {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let _guard = init_tracing(&repo_path.join("reports"))?;

    if let Err(err) = quorum::cli::run(cli).await {
        tracing::error!(%err, "workflow run failed");
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }

    Ok(())
}

/// JSON events roll daily into `reports/engine.log`; human-readable events
/// go to stderr. `workflow_id`/`phase`/`task_id` ride along as structured
/// fields on every event, so a single workflow's activity can be filtered
/// out of the shared stream without needing a file per workflow.
fn init_tracing(reports_dir: &Path) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(reports_dir)?;
    let file_appender = tracing_appender::rolling::daily(reports_dir, "engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(non_blocking);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(guard)
}
