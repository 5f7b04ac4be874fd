use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info};

mod auth;
mod core;
mod db;
mod notify;
mod queue;
mod tools;
mod web;
mod worker;

use crate::core::config::Settings;
use crate::core::context::ServiceContext;
use crate::core::datasets;
use crate::core::error::{ServiceError, ServiceResult};
use crate::web::server::start_web_server;
use crate::worker::WorkerPool;

#[derive(Debug, Parser)]
#[command(name = "scdata-hub", version, about = "Single-cell dataset hub")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API and the tool surface
    Serve {
        /// Queue consumers to run inside this process; with the in-process
        /// queue, 0 means WORKER_CONCURRENCY
        #[arg(long, env = "EMBEDDED_WORKERS", default_value_t = 0)]
        workers: usize,
    },
    /// Consume jobs from the queue
    Worker {
        /// Defaults to WORKER_CONCURRENCY
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Seed atlas datasets and their metadata from a JSON file
    ImportAtlas { file: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> ServiceResult<()> {
    let settings = Settings::from_env()?;
    match command {
        Command::Serve { workers } => serve(settings, workers).await,
        Command::Worker { concurrency } => {
            ensure_shared_queue(&settings)?;
            let concurrency = concurrency.unwrap_or(settings.worker_concurrency);
            let ctx = ServiceContext::connect(settings, false).await?;
            let pool = WorkerPool::spawn(ctx, concurrency);
            info!("{} worker(s) running. Press Ctrl+C to stop.", pool.size());
            tokio::signal::ctrl_c().await?;
            info!("Shutting down workers...");
            pool.shutdown().await;
            Ok(())
        }
        Command::ImportAtlas { file } => {
            let ctx = ServiceContext::connect(settings, false).await?;
            let summary = datasets::import_atlas(&ctx, &file).await?;
            info!(
                "Imported {}: {} created, {} updated",
                file.display(),
                summary.created,
                summary.updated
            );
            Ok(())
        }
    }
}

/// Consumers `serve` runs itself. Nothing outside this process can reach the
/// in-process queue, so it always gets at least one.
fn embedded_workers(settings: &Settings, requested: usize) -> usize {
    if requested == 0 && settings.redis_url.is_none() {
        settings.worker_concurrency.max(1)
    } else {
        requested
    }
}

/// A separate worker pool only sees jobs through a shared queue
fn ensure_shared_queue(settings: &Settings) -> ServiceResult<()> {
    match settings.redis_url {
        Some(_) => Ok(()),
        None => Err(ServiceError::Config(
            "the worker command needs REDIS_URL; the in-process queue is only served by `serve`".to_string(),
        )),
    }
}

async fn serve(settings: Settings, requested: usize) -> ServiceResult<()> {
    info!("Starting scdata-hub {}...", env!("CARGO_PKG_VERSION"));
    let workers = embedded_workers(&settings, requested);
    if workers != requested {
        info!("In-process queue selected; running {} embedded worker(s)", workers);
    }
    let ctx = ServiceContext::connect(settings, true).await?;
    let pool = (workers > 0).then(|| WorkerPool::spawn(ctx.clone(), workers));

    let server = start_web_server(ctx)?;
    let handle = server.handle();
    let server_task = tokio::spawn(server);

    info!("scdata-hub is now running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down scdata-hub...");

    // stop accepting requests, then let running jobs finish
    handle.stop(true).await;
    match server_task.await {
        Ok(Err(e)) => error!("Web server stopped with an error: {}", e),
        Err(e) => error!("Error during web server shutdown: {:?}", e),
        Ok(Ok(())) => {}
    }
    if let Some(pool) = pool {
        pool.shutdown().await;
    }

    info!("scdata-hub shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        Settings::from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
        .unwrap()
    }

    #[test]
    fn test_default_serve_consumes_its_own_queue() {
        let defaults = settings(&[("SECRET_KEY", "s")]);
        let cli = Cli::try_parse_from(["scdata-hub", "serve", "--workers", "0"]).unwrap();
        let Command::Serve { workers } = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(embedded_workers(&defaults, workers), defaults.worker_concurrency);
        assert!(embedded_workers(&defaults, workers) > 0);
        assert_eq!(embedded_workers(&defaults, 5), 5);

        let shared = settings(&[("SECRET_KEY", "s"), ("REDIS_URL", "redis://localhost:6379/0")]);
        assert_eq!(embedded_workers(&shared, 0), 0);
    }

    #[test]
    fn test_worker_command_needs_shared_queue() {
        assert!(matches!(
            ensure_shared_queue(&settings(&[])),
            Err(ServiceError::Config(_))
        ));
        assert!(ensure_shared_queue(&settings(&[("REDIS_URL", "redis://localhost:6379/0")])).is_ok());
    }
}
