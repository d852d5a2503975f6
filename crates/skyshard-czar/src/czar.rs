//! The czar: front-end coordinator for distributed SELECTs
//!
//! Owns the live query registry, recognizes in-band commands, hands
//! SELECTs to the analyzer/dispatcher pipeline and routes worker events to
//! the owning query's executor. Also runs the result-table TTL sweeper.

use dashmap::DashMap;
use skyshard_catalog::{CachingCatalog, CatalogAdmin, ChunkCatalog};
use skyshard_common::{CzarId, QueryId};
use skyshard_config::CzarConfig;
use skyshard_proto::RowBundle;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::analysis;
use crate::dispatch::{ExecContext, QueryExecutor};
use crate::error::{CzarError, CzarResult};
use crate::metadata::QueryMetadataStore;
use crate::results::ResultStore;
use crate::session::{
    CommandQuery, QueryMessage, QueryState, UserQuery, is_process_list_select, is_select,
    recognize,
};
use crate::transport::{WorkerChannelPool, WorkerEvent};

/// What a submitted statement turned into.
#[derive(Debug)]
pub enum Submission {
    /// A distributed SELECT now executing; await completion and fetch the
    /// result table.
    Executing { query_id: QueryId },
    /// `SUBMIT ...` accepted; the result is the query id itself.
    AsyncSubmitted { query_id: QueryId },
    /// `SELECT * FROM QSERV_RESULT(n)` resolved to a finished query.
    ResultHandle { query_id: QueryId },
    /// An administrative statement handled entirely on the czar.
    AdminCompleted { info: String },
    /// Process list contents.
    ProcessList(RowBundle),
    /// Cancellation was issued for the named query.
    CancelIssued { query_id: QueryId },
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// One czar process.
pub struct Czar {
    config: CzarConfig,
    catalog: Arc<CachingCatalog<Arc<dyn ChunkCatalog>>>,
    admin: Arc<dyn CatalogAdmin>,
    store: Arc<dyn ResultStore>,
    metadata: Arc<dyn QueryMetadataStore>,
    transport: Arc<WorkerChannelPool>,
    queries: DashMap<QueryId, Arc<UserQuery>>,
    routes: Arc<DashMap<QueryId, mpsc::Sender<WorkerEvent>>>,
    next_query_id: AtomicU64,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl Czar {
    /// Assemble a czar over its collaborators and start the event router
    /// and the result TTL sweeper.
    pub fn new(
        config: CzarConfig,
        catalog: Arc<dyn ChunkCatalog>,
        admin: Arc<dyn CatalogAdmin>,
        store: Arc<dyn ResultStore>,
        metadata: Arc<dyn QueryMetadataStore>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let transport = WorkerChannelPool::new(config.transport.clone(), events_tx);
        let czar = Arc::new(Self {
            catalog: Arc::new(CachingCatalog::new(catalog)),
            admin,
            store,
            metadata,
            transport,
            queries: DashMap::new(),
            routes: Arc::new(DashMap::new()),
            next_query_id: AtomicU64::new(1),
            started_at: chrono::Utc::now(),
            config,
        });
        czar.spawn_router(events_rx);
        czar.spawn_sweeper();
        czar
    }

    /// Submit one SQL statement.
    ///
    /// # Errors
    /// Plan, syntax and unsupported errors are returned directly; they are
    /// also recorded on the query's message store when an id was assigned.
    pub async fn submit(self: &Arc<Self>, sql: &str) -> CzarResult<Submission> {
        let sql = sql.trim();
        if let Some(command) = recognize(sql) {
            return self.run_command(command).await;
        }
        if is_process_list_select(sql) {
            return Ok(Submission::ProcessList(self.process_list(true)));
        }
        if is_select(sql) {
            let query_id = self.start_select(sql).await?;
            return Ok(Submission::Executing { query_id });
        }
        Err(CzarError::Unsupported(format!(
            "statement is neither a SELECT nor a recognized command: {sql}"
        )))
    }

    async fn run_command(self: &Arc<Self>, command: CommandQuery) -> CzarResult<Submission> {
        match command {
            CommandQuery::DropDb { db } => {
                self.admin.drop_database(&db).await?;
                self.catalog.invalidate(Some(&db));
                Ok(Submission::AdminCompleted {
                    info: format!("database {db} dropped"),
                })
            }
            CommandQuery::DropTable { db, table } => {
                let db = db.unwrap_or_else(|| self.config.dispatch.default_database.clone());
                self.admin.drop_table(&db, &table).await?;
                self.catalog.invalidate(Some(&db));
                Ok(Submission::AdminCompleted {
                    info: format!("table {db}.{table} dropped"),
                })
            }
            CommandQuery::FlushChunksCache { db } => {
                self.catalog.invalidate(db.as_deref());
                Ok(Submission::AdminCompleted {
                    info: "chunk cache flushed".to_string(),
                })
            }
            CommandQuery::ShowProcessList { full } => {
                Ok(Submission::ProcessList(self.process_list(full)))
            }
            CommandQuery::Submit { inner } => {
                if !is_select(&inner) {
                    return Err(CzarError::Unsupported(
                        "SUBMIT accepts only SELECT statements".to_string(),
                    ));
                }
                let query_id = self.start_select(&inner).await?;
                Ok(Submission::AsyncSubmitted { query_id })
            }
            CommandQuery::SelectResult { query_id } => {
                let query = self
                    .queries
                    .get(&query_id)
                    .map(|q| Arc::clone(&q))
                    .ok_or(CzarError::UnknownQuery(query_id.0))?;
                match query.state() {
                    QueryState::Completed => Ok(Submission::ResultHandle { query_id }),
                    QueryState::InProgress | QueryState::Unknown => Err(CzarError::Internal(
                        format!("query {query_id} is still executing"),
                    )),
                    other => Err(CzarError::Internal(format!(
                        "query {query_id} finished as {}",
                        other.as_str()
                    ))),
                }
            }
            CommandQuery::Kill { thread_id } => {
                // Thread ids and query ids share a namespace here.
                let query_id = QueryId(thread_id);
                self.cancel(query_id)?;
                Ok(Submission::CancelIssued { query_id })
            }
            CommandQuery::CancelQuery { query_id } => {
                self.cancel(query_id)?;
                Ok(Submission::CancelIssued { query_id })
            }
            CommandQuery::Call { body } => {
                info!(procedure = %body, "administrative CALL acknowledged");
                Ok(Submission::AdminCompleted {
                    info: format!("procedure acknowledged: {body}"),
                })
            }
        }
    }

    /// Analyze and launch one SELECT; returns its query id.
    async fn start_select(self: &Arc<Self>, sql: &str) -> CzarResult<QueryId> {
        let query_id = QueryId(self.next_query_id.fetch_add(1, Ordering::SeqCst));
        let user_query = Arc::new(UserQuery::new(query_id, sql));
        self.queries.insert(query_id, Arc::clone(&user_query));
        self.metadata.record_query(query_id, sql).await?;

        let spec = match analysis::analyze(
            sql,
            &self.config.dispatch.default_database,
            self.catalog.as_ref(),
        )
        .await
        {
            Ok(spec) => spec,
            Err(err) => {
                user_query.messages.error(err.code(), err.to_string());
                user_query.set_state(QueryState::Failed);
                let _ = self.metadata.update_state(query_id, QueryState::Failed).await;
                return Err(err);
            }
        };

        let (events_tx, events_rx) = mpsc::channel(256);
        self.routes.insert(query_id, events_tx);

        let ctx = Arc::new(ExecContext {
            czar_id: CzarId(self.config.czar_id),
            dispatch: self.config.dispatch.clone(),
            catalog: self.catalog_handle_arc(),
            store: Arc::clone(&self.store),
            metadata: Arc::clone(&self.metadata),
            transport: Arc::clone(&self.transport),
        });
        let executor = QueryExecutor::new(ctx, Arc::clone(&user_query), spec, events_rx);
        let routes = Arc::clone(&self.routes);
        tokio::spawn(async move {
            executor.run().await;
            routes.remove(&query_id);
        });
        Ok(query_id)
    }

    fn catalog_handle_arc(&self) -> Arc<dyn ChunkCatalog> {
        Arc::clone(&self.catalog) as Arc<dyn ChunkCatalog>
    }

    /// Request cancellation of a running query. Idempotent.
    ///
    /// # Errors
    /// `UnknownQuery` when the id was never assigned or already swept.
    pub fn cancel(&self, query_id: QueryId) -> CzarResult<()> {
        let query = self
            .queries
            .get(&query_id)
            .ok_or(CzarError::UnknownQuery(query_id.0))?;
        query.request_cancel();
        Ok(())
    }

    /// Wait for a query to reach a terminal state.
    ///
    /// # Errors
    /// `UnknownQuery` for unassigned ids.
    pub async fn await_completion(&self, query_id: QueryId) -> CzarResult<QueryState> {
        let query = self
            .queries
            .get(&query_id)
            .map(|q| Arc::clone(&q))
            .ok_or(CzarError::UnknownQuery(query_id.0))?;
        Ok(query.await_completion().await)
    }

    pub fn state(&self, query_id: QueryId) -> CzarResult<QueryState> {
        self.queries
            .get(&query_id)
            .map(|q| q.state())
            .ok_or(CzarError::UnknownQuery(query_id.0))
    }

    pub fn messages(&self, query_id: QueryId) -> Vec<QueryMessage> {
        self.queries
            .get(&query_id)
            .map(|q| q.messages.snapshot())
            .unwrap_or_default()
    }

    /// Fetch the final result rows of a completed query.
    ///
    /// # Errors
    /// A missing or dropped table surfaces as a `NO_SUCH_TABLE` store error.
    pub async fn fetch_result(&self, query_id: QueryId) -> CzarResult<RowBundle> {
        self.store.fetch_result(query_id).await
    }

    /// The synthetic process list served for `SHOW PROCESSLIST` and
    /// `INFORMATION_SCHEMA.PROCESSLIST`.
    pub fn process_list(&self, full: bool) -> RowBundle {
        let mut bundle = RowBundle::new(vec![
            "Id".to_string(),
            "State".to_string(),
            "Submitted".to_string(),
            "Info".to_string(),
        ]);
        let mut entries: Vec<Arc<UserQuery>> =
            self.queries.iter().map(|q| Arc::clone(&q)).collect();
        entries.sort_by_key(|q| q.id);
        for query in entries {
            let info = if full || query.sql.len() <= 100 {
                query.sql.clone()
            } else {
                format!("{}…", query.sql.chars().take(100).collect::<String>())
            };
            bundle.rows.push(vec![
                Some(query.id.to_string()),
                Some(query.state().as_str().to_string()),
                Some(query.submitted_at.to_rfc3339()),
                Some(info),
            ]);
        }
        bundle
    }

    /// Uptime and query counts for the status endpoint.
    pub fn status_summary(&self) -> serde_json::Value {
        let mut in_progress = 0usize;
        let mut completed = 0usize;
        let mut failed = 0usize;
        for query in self.queries.iter() {
            match query.state() {
                QueryState::InProgress | QueryState::Unknown => in_progress += 1,
                QueryState::Completed => completed += 1,
                QueryState::Failed | QueryState::Cancelled => failed += 1,
            }
        }
        serde_json::json!({
            "success": true,
            "error": "",
            "czar_id": self.config.czar_id,
            "started_at": self.started_at.to_rfc3339(),
            "queries": {
                "in_progress": in_progress,
                "completed": completed,
                "failed_or_cancelled": failed,
            },
        })
    }

    /// Forward worker events to the owning query's executor. Channel-level
    /// events fan out to every live query.
    fn spawn_router(self: &Arc<Self>, mut events_rx: mpsc::Receiver<WorkerEvent>) {
        let routes = Arc::clone(&self.routes);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event.query_id() {
                    Some(query_id) => {
                        // Clone the sender out so no map guard is held
                        // across the await.
                        let route = routes.get(&query_id).map(|r| r.clone());
                        if let Some(route) = route {
                            if route.send(event).await.is_err() {
                                debug!(%query_id, "executor gone, dropping event");
                            }
                        }
                    }
                    None => {
                        if let WorkerEvent::ChannelClosed { addr } = &event {
                            let targets: Vec<mpsc::Sender<WorkerEvent>> =
                                routes.iter().map(|r| r.clone()).collect();
                            for route in targets {
                                let _ = route
                                    .send(WorkerEvent::ChannelClosed { addr: addr.clone() })
                                    .await;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Drop result tables (and release query entries) past their TTL.
    fn spawn_sweeper(self: &Arc<Self>) {
        let czar = Arc::clone(self);
        tokio::spawn(async move {
            let ttl = chrono::Duration::seconds(czar.config.dispatch.result_ttl_seconds as i64);
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now();
                let expired: Vec<QueryId> = czar
                    .queries
                    .iter()
                    .filter(|q| {
                        q.state().is_terminal()
                            && q.finished_at().is_some_and(|at| now - at > ttl)
                    })
                    .map(|q| q.id)
                    .collect();
                for query_id in expired {
                    info!(%query_id, "sweeping expired result");
                    if let Err(err) = czar.store.drop_result(query_id).await {
                        warn!(%query_id, error = %err, "result sweep failed");
                        continue;
                    }
                    czar.queries.remove(&query_id);
                }
            }
        });
    }
}
