//! Local chunk query execution
//!
//! The scheduler hands admitted tasks to a [`QueryRunner`], which executes
//! the per-chunk SQL against the worker's local MySQL instance and streams
//! row batches back. The trait seam keeps MySQL out of the scheduler tests.

use async_trait::async_trait;
use dashmap::DashMap;
use skyshard_proto::RowBundle;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{Column, MySqlPool, Row};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{WorkerError, WorkerResult};

/// Streamed result of one chunk query: row batches in read order, each of
/// roughly the requested size.
pub type BatchStream = mpsc::Receiver<WorkerResult<RowBundle>>;

/// Executes one SQL statement against a chunk database.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    /// Run `sql` against database `db`, producing batches of up to
    /// `batch_rows` rows.
    ///
    /// # Errors
    /// Fails fast on connection errors; per-row errors arrive in-stream.
    async fn run(&self, db: &str, sql: &str, batch_rows: usize) -> WorkerResult<BatchStream>;
}

/// Production runner backed by the worker's local MySQL server.
pub struct MySqlQueryRunner {
    pool: MySqlPool,
}

impl MySqlQueryRunner {
    /// Connect lazily; chunk databases are selected per statement.
    ///
    /// # Errors
    /// Returns a database error when the URL cannot be parsed.
    pub fn connect_lazy(url: &str, max_connections: u32, timeout: Duration) -> WorkerResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect_lazy(url)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl QueryRunner for MySqlQueryRunner {
    async fn run(&self, db: &str, sql: &str, batch_rows: usize) -> WorkerResult<BatchStream> {
        let (tx, rx) = mpsc::channel(2);
        let pool = self.pool.clone();
        let statement = sql.to_string();
        let database = db.to_string();
        tokio::spawn(async move {
            if let Err(err) = stream_rows(&pool, &database, &statement, batch_rows, &tx).await {
                error!(error = %err, "chunk query failed");
                let _ = tx.send(Err(err)).await;
            }
        });
        Ok(rx)
    }
}

async fn stream_rows(
    pool: &MySqlPool,
    db: &str,
    sql: &str,
    batch_rows: usize,
    tx: &mpsc::Sender<WorkerResult<RowBundle>>,
) -> WorkerResult<()> {
    use futures::TryStreamExt;

    let mut conn = pool.acquire().await?;
    sqlx::query(&format!("USE `{db}`"))
        .execute(conn.as_mut())
        .await?;

    let mut rows = sqlx::query(sql).fetch(conn.as_mut());
    let mut bundle: Option<RowBundle> = None;
    while let Some(row) = rows.try_next().await? {
        let bundle_ref = bundle.get_or_insert_with(|| RowBundle::new(column_names(&row)));
        bundle_ref.rows.push(row_cells(&row));
        if bundle_ref.rows.len() >= batch_rows {
            let full = bundle.take().unwrap_or_default();
            let columns = full.columns.clone();
            if tx.send(Ok(full)).await.is_err() {
                debug!("batch receiver dropped, abandoning query stream");
                return Ok(());
            }
            bundle = Some(RowBundle::new(columns));
        }
    }
    if let Some(tail) = bundle {
        let _ = tx.send(Ok(tail)).await;
    }
    Ok(())
}

fn column_names(row: &MySqlRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn row_cells(row: &MySqlRow) -> Vec<Option<String>> {
    (0..row.columns().len()).map(|i| cell_text(row, i)).collect()
}

/// Decode one cell to its text form, trying the common MySQL column types
/// in turn. Unknown types degrade to NULL rather than failing the scan.
fn cell_text(row: &MySqlRow, idx: usize) -> Option<String> {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v;
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|x| x.to_string());
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map(|x| x.to_string());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|x| x.to_string());
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(|x| String::from_utf8_lossy(&x).into_owned());
    }
    None
}

/// Test runner returning canned bundles and recording executed statements.
#[derive(Default)]
pub struct MockQueryRunner {
    canned: DashMap<String, RowBundle>,
    failures: DashMap<String, String>,
    delays: DashMap<String, Duration>,
    executed: Mutex<Vec<String>>,
}

impl MockQueryRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result for an exact SQL string.
    pub fn stage(&self, sql: &str, bundle: RowBundle) {
        self.canned.insert(sql.to_string(), bundle);
    }

    /// Make an exact SQL string fail with the given message.
    pub fn stage_failure(&self, sql: &str, message: &str) {
        self.failures.insert(sql.to_string(), message.to_string());
    }

    /// Delay delivery of an exact SQL string's batches, to exercise
    /// cancellation mid-query.
    pub fn stage_delay(&self, sql: &str, delay: Duration) {
        self.delays.insert(sql.to_string(), delay);
    }

    /// SQL statements executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl QueryRunner for MockQueryRunner {
    async fn run(&self, _db: &str, sql: &str, _batch_rows: usize) -> WorkerResult<BatchStream> {
        if let Ok(mut log) = self.executed.lock() {
            log.push(sql.to_string());
        }
        if let Some(message) = self.failures.get(sql) {
            return Err(WorkerError::QueryExec(message.clone()));
        }
        let delay = self.delays.get(sql).map(|d| *d);
        let bundle = self
            .canned
            .get(sql)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if !bundle.rows.is_empty() || !bundle.columns.is_empty() {
                let _ = tx.send(Ok(bundle)).await;
            }
        });
        Ok(rx)
    }
}
