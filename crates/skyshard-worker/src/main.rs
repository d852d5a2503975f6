//! Skyshard worker daemon
//!
//! Serves chunk queries for the czar over the framed transport.

use clap::Parser;
use skyshard_common::ChunkId;
use skyshard_config::{Validate, WorkerConfig};
use skyshard_worker::runner::MySqlQueryRunner;
use skyshard_worker::server::{WorkerServer, register_with_registry};
use skyshard_worker::{ServiceContext, executor};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

type MainResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "skyshard-worker", about = "Skyshard chunk worker")]
struct Args {
    /// Initial chunk inventory as comma-separated db:chunk pairs,
    /// e.g. `LSST:100,LSST:200`. More can be added via admin commands.
    #[arg(long, default_value = "")]
    chunks: String,
}

#[tokio::main]
async fn main() -> MainResult {
    skyshard_common::initialize_environment();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = WorkerConfig::from_env();
    config.validate()?;
    info!(
        name = config.name,
        port = config.transport.worker_port,
        db = config.database.safe_connection_string(),
        "starting skyshard worker"
    );

    let runner = Arc::new(MySqlQueryRunner::connect_lazy(
        &config.database.connection_url(),
        config.database.max_connections,
        Duration::from_secs(config.database.timeout_seconds),
    )?);
    let port = config.transport.worker_port;
    let ctx = ServiceContext::new(config, runner);

    for (db, chunk) in parse_chunks(&args.chunks) {
        ctx.add_chunk(&db, chunk);
    }

    let _pool = executor::spawn_pool(&ctx);
    register_with_registry(&ctx).await;

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    WorkerServer::new(ctx).run(listener).await?;
    Ok(())
}

fn parse_chunks(spec: &str) -> Vec<(String, ChunkId)> {
    spec.split(',')
        .filter_map(|pair| {
            let (db, chunk) = pair.trim().split_once(':')?;
            Some((db.to_string(), ChunkId(chunk.parse().ok()?)))
        })
        .collect()
}
