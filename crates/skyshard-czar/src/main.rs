//! Skyshard czar daemon
//!
//! Wires the catalog, result store and metadata store together, then serves
//! the status endpoint while executing queries submitted through it.

use clap::Parser;
use skyshard_catalog::{ChunkCatalog, ChunkGeometry, FamilyId, InMemoryCatalog};
use skyshard_common::ChunkId;
use skyshard_config::{CzarConfig, Validate};
use skyshard_czar::metadata::SqlMetadataStore;
use skyshard_czar::registry::RegistryClient;
use skyshard_czar::results::SqlResultStore;
use skyshard_czar::status;
use skyshard_czar::Czar;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

type MainResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "skyshard-czar", about = "Skyshard front-end coordinator")]
struct Args {
    /// Catalog seed file (JSON) describing tables and chunk placement.
    #[arg(long)]
    catalog: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> MainResult {
    skyshard_common::initialize_environment();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = CzarConfig::from_env();
    config.validate()?;
    info!(
        czar_id = config.czar_id,
        db = config.database.safe_connection_string(),
        "starting skyshard czar"
    );

    let timeout = Duration::from_secs(config.database.timeout_seconds);
    let store = Arc::new(SqlResultStore::connect_lazy(
        &config.database.connection_url(),
        config.database.max_connections,
        timeout,
    )?);
    let metadata = Arc::new(SqlMetadataStore::connect_lazy(
        &config.database.connection_url(),
        config.database.max_connections,
        timeout,
    )?);
    if let Err(err) = metadata.migrate().await {
        warn!(error = %err, "metadata migration failed; continuing without persistence");
    }

    let catalog = Arc::new(build_catalog(&args, &config).await);
    let czar = Czar::new(
        config.clone(),
        Arc::clone(&catalog) as Arc<dyn ChunkCatalog>,
        catalog,
        store,
        metadata,
    );

    let app = status::create_router(Arc::clone(&czar));
    let addr: SocketAddr = ([0, 0, 0, 0], config.status_port).into();
    info!(%addr, "status endpoint listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Assemble the chunk catalog from the seed file (if given) and the worker
/// registry.
async fn build_catalog(args: &Args, config: &CzarConfig) -> InMemoryCatalog {
    let catalog = InMemoryCatalog::new();
    if let Some(path) = &args.catalog {
        match std::fs::read_to_string(path) {
            Ok(contents) => seed_catalog(&catalog, &contents),
            Err(err) => warn!(error = %err, "catalog seed file unreadable"),
        }
    }
    let registry = RegistryClient::new(&config.registry);
    match registry.workers().await {
        Ok(workers) => info!(count = workers.len(), "registry workers discovered"),
        Err(err) => warn!(error = %err, "registry unavailable at startup"),
    }
    catalog
}

/// Seed format: one JSON object per line, either a director table or a
/// chunk placement entry.
fn seed_catalog(catalog: &InMemoryCatalog, contents: &str) {
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            warn!(line, "unparseable catalog seed line");
            continue;
        };
        match value.get("kind").and_then(|k| k.as_str()) {
            Some("family") => {
                let family = FamilyId(value["family"].as_u64().unwrap_or(1) as u32);
                let stripes = value["stripes"].as_u64().unwrap_or(18) as u32;
                let sub_stripes = value["sub_stripes"].as_u64().unwrap_or(5) as u32;
                catalog.add_family(family, ChunkGeometry::new(stripes, sub_stripes));
            }
            Some("director") => {
                catalog.add_director(
                    value["db"].as_str().unwrap_or_default(),
                    value["table"].as_str().unwrap_or_default(),
                    value["primary_key"].as_str().unwrap_or("id"),
                    value["lon"].as_str().unwrap_or("ra"),
                    value["lat"].as_str().unwrap_or("decl"),
                    FamilyId(value["family"].as_u64().unwrap_or(1) as u32),
                    skyshard_proto::ScanRating::Medium,
                );
            }
            Some("placement") => {
                catalog.place_chunk(
                    value["db"].as_str().unwrap_or_default(),
                    ChunkId(value["chunk"].as_u64().unwrap_or(0) as u32),
                    skyshard_catalog::WorkerRef {
                        name: value["worker"].as_str().unwrap_or_default().to_string(),
                        host: value["host"].as_str().unwrap_or("localhost").to_string(),
                        port: value["port"].as_u64().unwrap_or(25002) as u16,
                    },
                );
            }
            other => warn!(?other, "unknown catalog seed kind"),
        }
    }
}
