//! User query metadata persistence
//!
//! The czar records every submitted query and per-job outcome in its local
//! database, so operators can audit what ran and async results survive a
//! proxy reconnect. Workers persist nothing; their in-flight queries fail
//! over to a retry on restart.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use skyshard_common::{AttemptCount, ChunkId, JobId, QueryId};
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;
use std::time::Duration;

use crate::error::CzarResult;
use crate::session::user_query::QueryState;

/// Persisted snapshot of one user query.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub query_id: QueryId,
    pub sql: String,
    pub state: QueryState,
    pub submitted_at: chrono::DateTime<Utc>,
}

/// Write-side of the czar's metadata database.
#[async_trait]
pub trait QueryMetadataStore: Send + Sync {
    async fn record_query(&self, query_id: QueryId, sql: &str) -> CzarResult<()>;
    async fn update_state(&self, query_id: QueryId, state: QueryState) -> CzarResult<()>;
    async fn record_job_outcome(
        &self,
        query_id: QueryId,
        job_id: JobId,
        chunk: ChunkId,
        attempt: AttemptCount,
        outcome: &str,
    ) -> CzarResult<()>;
    async fn query(&self, query_id: QueryId) -> CzarResult<Option<QueryRecord>>;
}

/// In-process metadata store for tests and single-node runs.
#[derive(Default)]
pub struct MemMetadataStore {
    queries: DashMap<QueryId, QueryRecord>,
    outcomes: DashMap<(QueryId, JobId, AttemptCount), String>,
}

impl MemMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_outcome(&self, query_id: QueryId, job_id: JobId, attempt: AttemptCount) -> Option<String> {
        self.outcomes
            .get(&(query_id, job_id, attempt))
            .map(|v| v.clone())
    }
}

#[async_trait]
impl QueryMetadataStore for MemMetadataStore {
    async fn record_query(&self, query_id: QueryId, sql: &str) -> CzarResult<()> {
        self.queries.insert(
            query_id,
            QueryRecord {
                query_id,
                sql: sql.to_string(),
                state: QueryState::InProgress,
                submitted_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn update_state(&self, query_id: QueryId, state: QueryState) -> CzarResult<()> {
        if let Some(mut record) = self.queries.get_mut(&query_id) {
            record.state = state;
        }
        Ok(())
    }

    async fn record_job_outcome(
        &self,
        query_id: QueryId,
        job_id: JobId,
        _chunk: ChunkId,
        attempt: AttemptCount,
        outcome: &str,
    ) -> CzarResult<()> {
        self.outcomes
            .insert((query_id, job_id, attempt), outcome.to_string());
        Ok(())
    }

    async fn query(&self, query_id: QueryId) -> CzarResult<Option<QueryRecord>> {
        Ok(self.queries.get(&query_id).map(|r| r.clone()))
    }
}

/// MySQL-backed metadata store.
pub struct SqlMetadataStore {
    pool: MySqlPool,
}

impl SqlMetadataStore {
    /// Connect lazily; tables are created on first use via [`Self::migrate`].
    ///
    /// # Errors
    /// Returns a store error when the URL cannot be parsed.
    pub fn connect_lazy(url: &str, max_connections: u32, timeout: Duration) -> CzarResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect_lazy(url)?;
        Ok(Self { pool })
    }

    /// Create the metadata tables when missing.
    ///
    /// # Errors
    /// Propagates DDL failures.
    pub async fn migrate(&self) -> CzarResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS qserv_queries (
                query_id BIGINT UNSIGNED PRIMARY KEY,
                sql_text TEXT NOT NULL,
                state VARCHAR(16) NOT NULL,
                submitted_at DATETIME NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS qserv_job_outcomes (
                query_id BIGINT UNSIGNED NOT NULL,
                job_id INT UNSIGNED NOT NULL,
                chunk_id INT UNSIGNED NOT NULL,
                attempt INT UNSIGNED NOT NULL,
                outcome VARCHAR(32) NOT NULL,
                PRIMARY KEY (query_id, job_id, attempt)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QueryMetadataStore for SqlMetadataStore {
    async fn record_query(&self, query_id: QueryId, sql: &str) -> CzarResult<()> {
        sqlx::query(
            "INSERT INTO qserv_queries (query_id, sql_text, state, submitted_at)
             VALUES (?, ?, ?, UTC_TIMESTAMP())",
        )
        .bind(query_id.0)
        .bind(sql)
        .bind(QueryState::InProgress.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_state(&self, query_id: QueryId, state: QueryState) -> CzarResult<()> {
        sqlx::query("UPDATE qserv_queries SET state = ? WHERE query_id = ?")
            .bind(state.as_str())
            .bind(query_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_job_outcome(
        &self,
        query_id: QueryId,
        job_id: JobId,
        chunk: ChunkId,
        attempt: AttemptCount,
        outcome: &str,
    ) -> CzarResult<()> {
        sqlx::query(
            "REPLACE INTO qserv_job_outcomes (query_id, job_id, chunk_id, attempt, outcome)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(query_id.0)
        .bind(job_id.0)
        .bind(chunk.0)
        .bind(attempt)
        .bind(outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(&self, query_id: QueryId) -> CzarResult<Option<QueryRecord>> {
        use sqlx::Row;
        let row = sqlx::query(
            "SELECT query_id, sql_text, state, submitted_at FROM qserv_queries WHERE query_id = ?",
        )
        .bind(query_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| QueryRecord {
            query_id,
            sql: row.try_get("sql_text").unwrap_or_default(),
            state: QueryState::parse(&row.try_get::<String, _>("state").unwrap_or_default()),
            submitted_at: row.try_get("submitted_at").unwrap_or_else(|_| Utc::now()),
        }))
    }
}
