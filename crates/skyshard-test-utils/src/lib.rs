//! Shared fixtures for integration tests
//!
//! Provides the canonical test catalog (an `LSST` database with the
//! `Object` director and `Source` child) and a helper that runs a real
//! worker on an ephemeral loopback port over the mock query runner.

use skyshard_catalog::{ChunkGeometry, FamilyId, InMemoryCatalog, TableKey, WorkerRef};
use skyshard_common::ChunkId;
use skyshard_config::WorkerConfig;
use skyshard_proto::ScanRating;
use skyshard_worker::runner::MockQueryRunner;
use skyshard_worker::server::WorkerServer;
use skyshard_worker::{ServiceContext, executor};
use std::sync::Arc;
use tokio::net::TcpListener;

/// The partitioning family used by every fixture table.
pub const TEST_FAMILY: FamilyId = FamilyId(1);

/// Build the canonical catalog: `LSST.Object` (director, pk `id`, position
/// `ra`/`decl`) and `LSST.Source` (child via `objectId`), chunk geometry of
/// 12 stripes with 3 sub-stripes.
pub fn fixture_catalog() -> InMemoryCatalog {
    let catalog = InMemoryCatalog::new();
    catalog.add_family(TEST_FAMILY, ChunkGeometry::new(12, 3));
    catalog.add_director(
        "LSST",
        "Object",
        "id",
        "ra",
        "decl",
        TEST_FAMILY,
        ScanRating::Medium,
    );
    catalog.add_child(
        "LSST",
        "Source",
        "objectId",
        TableKey::new("LSST", "Object"),
        ScanRating::Slow,
    );
    catalog
}

/// Place the given chunks on one worker.
pub fn place_chunks(catalog: &InMemoryCatalog, worker: &WorkerRef, chunks: &[u32]) {
    for &chunk in chunks {
        catalog.place_chunk("LSST", ChunkId(chunk), worker.clone());
    }
}

/// A live worker process-in-miniature for end-to-end tests.
pub struct TestWorker {
    pub worker_ref: WorkerRef,
    pub runner: Arc<MockQueryRunner>,
    pub ctx: Arc<ServiceContext>,
}

/// Start a worker on an ephemeral loopback port, owning the given chunks,
/// executing queries through a [`MockQueryRunner`].
///
/// # Panics
/// Panics when the loopback listener cannot be bound.
pub async fn spawn_worker(name: &str, chunks: &[u32]) -> TestWorker {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind loopback listener");
    let port = listener.local_addr().expect("local addr").port();

    let config = WorkerConfig {
        name: name.to_string(),
        transport: skyshard_config::TransportConfig {
            worker_port: port,
            ..skyshard_config::TransportConfig::default()
        },
        scheduler: skyshard_config::SchedulerConfig {
            pool_size: 4,
            ..skyshard_config::SchedulerConfig::default()
        },
        ..WorkerConfig::default()
    };

    let runner = Arc::new(MockQueryRunner::new());
    let ctx = ServiceContext::new(config, Arc::clone(&runner) as _);
    for &chunk in chunks {
        ctx.add_chunk("LSST", ChunkId(chunk));
    }
    let _pool = executor::spawn_pool(&ctx);

    let server_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        let _ = WorkerServer::new(server_ctx).run(listener).await;
    });

    TestWorker {
        worker_ref: WorkerRef {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port,
        },
        runner,
        ctx,
    }
}
