mod analytics;
mod app;
mod catalogue;
mod http;
mod model;
mod read_api;
mod refreshers;
mod scheduler;
mod status;
mod store;

use app::App;
use clap::{Parser, Subcommand};
use pipeline_core::{telemetry, Config};
use sqlx::postgres::PgPoolOptions;
use std::process;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[clap(name = "dex-pipeline")]
#[clap(about = "DEX trading data aggregation pipeline", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations.
    Migrate,

    /// Run the HTTP read API and every scheduled refresher.
    Serve,

    /// Backfill one grid's history over a fixed date range, then exit.
    Backfill {
        /// RFC3339 start timestamp.
        #[clap(long)]
        start: chrono::DateTime<chrono::Utc>,

        /// RFC3339 end timestamp; defaults to now.
        #[clap(long)]
        end: Option<chrono::DateTime<chrono::Utc>>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "fatal error");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;
    let metrics_handle = telemetry::init(&config.telemetry)?;

    let cli = Cli::parse();

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await?;

    match cli.command {
        Commands::Migrate => {
            info!("running database migrations");
            sqlx::migrate!("../migrations").run(&pool).await?;
            info!("migrations completed");
        }

        Commands::Serve => {
            let mut app = App::new(config.clone(), pool, metrics_handle).await?;
            app.bootstrap().await;
            app.spawn_jobs();

            let state = app.state();
            let router = http::router(state);
            let addr = format!("{}:{}", config.http.bind_addr, config.http.bind_port);
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(addr = %addr, "http server listening");

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            info!("http server stopped, shutting down background jobs");
            app.shutdown().await;
        }

        Commands::Backfill { start, end } => {
            let app = App::new(config.clone(), pool, metrics_handle).await?;
            run_backfill(&app, start, end).await?;
            app.shutdown().await;
        }
    }

    telemetry::shutdown();
    Ok(())
}

/// Drives a historical backfill in 7-day chunks with a short pause between
/// each, so a single run never holds one enormous analytics query open.
/// `should_halt_backfill` errors (quota exhaustion, auth failure) stop the
/// whole pass immediately rather than skip-and-continue.
async fn run_backfill(
    app: &App,
    start: chrono::DateTime<chrono::Utc>,
    end: Option<chrono::DateTime<chrono::Utc>>,
) -> anyhow::Result<()> {
    let end = end.unwrap_or_else(chrono::Utc::now);
    let chunk = chrono::Duration::days(7);
    let mut cursor = start;
    let mut total = 0usize;
    let mut chunks_processed = 0usize;

    info!(start = %start, end = %end, "starting backfill");

    while cursor < end {
        let chunk_end = (cursor + chunk).min(end);
        match app.ten_minute_refresher().backfill_range(cursor, Some(chunk_end)).await {
            Ok(inserted) => {
                total += inserted;
                chunks_processed += 1;
                info!(chunk_start = %cursor, chunk_end = %chunk_end, inserted, total, "backfilled chunk");
            }
            Err(e) if e.should_halt_backfill() => {
                error!(
                    error = %e,
                    chunks_processed,
                    updated = total,
                    resume_from = %cursor,
                    "backfill halted by a non-retryable upstream error"
                );
                print_recovery_menu(&e, cursor);
                return Err(e.into());
            }
            Err(e) => {
                warn!(error = %e, chunk_start = %cursor, "chunk failed, skipping and continuing");
            }
        }

        cursor = chunk_end;
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    info!(total, chunks_processed, "backfill complete");
    Ok(())
}

/// Printed to stderr on a halted backfill pass: gives the operator an
/// actionable set of next steps instead of a bare stack trace, and names the
/// exact `--start` to resume from.
fn print_recovery_menu(error: &pipeline_core::Error, resume_from: chrono::DateTime<chrono::Utc>) {
    eprintln!("backfill halted: {error}");
    eprintln!();
    eprintln!("recovery options:");
    eprintln!("  1. wait        - retry later once the upstream quota window resets");
    eprintln!("  2. upgrade      - raise the analytics plan/quota and rerun");
    eprintln!("  3. db-only      - serve reads from whatever history is already stored, skip further backfill");
    eprintln!("  4. resume later - rerun this command with --start {} to continue from here", resume_from.to_rfc3339());
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
