//! Result staging and merging storage
//!
//! Per-job row bundles are staged into a union table tagged with
//! `(job, attempt)` so retries can be scrubbed, then folded into the final
//! `qserv_result_<id>` table by the merge statement. The trait seam keeps
//! MySQL out of the pipeline tests; the in-memory store executes the
//! structured merge plan directly.

use async_trait::async_trait;
use dashmap::DashMap;
use skyshard_common::{AttemptCount, JobId, QueryId};
use skyshard_proto::RowBundle;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{Column, MySqlPool, Row};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::analysis::{MergeMode, MergePlan, MergeSource};
use crate::error::{CzarError, CzarResult};

/// Storage backend for result staging and merging.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create the staging table for a query's per-job union.
    async fn create_result(&self, query_id: QueryId, columns: &[String]) -> CzarResult<()>;

    /// Stage one bundle under its `(job, attempt)` tag.
    async fn append_bundle(
        &self,
        query_id: QueryId,
        job_id: JobId,
        attempt: AttemptCount,
        bundle: &RowBundle,
    ) -> CzarResult<()>;

    /// Remove every staged row of one attempt (checksum failure or retry).
    async fn scrub_attempt(
        &self,
        query_id: QueryId,
        job_id: JobId,
        attempt: AttemptCount,
    ) -> CzarResult<()>;

    /// Run the merge statement over the union, producing the final result.
    async fn finalize(
        &self,
        query_id: QueryId,
        columns: &[String],
        merge: &MergePlan,
    ) -> CzarResult<()>;

    /// Read the final result table.
    async fn fetch_result(&self, query_id: QueryId) -> CzarResult<RowBundle>;

    /// Drop all tables of a query. Idempotent.
    async fn drop_result(&self, query_id: QueryId) -> CzarResult<()>;

    /// Execute a non-partitioned statement directly into the result table.
    async fn run_local(&self, query_id: QueryId, sql: &str) -> CzarResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemResult {
    columns: Vec<String>,
    /// `(job, attempt, cells)` staging rows.
    staged: Vec<(JobId, AttemptCount, Vec<Option<String>>)>,
    final_rows: Option<(Vec<String>, Vec<Vec<Option<String>>>)>,
}

/// Store backed by process memory; executes merge plans structurally.
#[derive(Default)]
pub struct MemResultStore {
    results: DashMap<QueryId, MemResult>,
}

impl MemResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows currently staged for a job, for tests asserting scrubbing.
    pub fn staged_rows(&self, query_id: QueryId, job_id: JobId) -> Vec<(AttemptCount, Vec<Option<String>>)> {
        self.results
            .get(&query_id)
            .map(|r| {
                r.staged
                    .iter()
                    .filter(|(j, _, _)| *j == job_id)
                    .map(|(_, a, cells)| (*a, cells.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResultStore for MemResultStore {
    async fn create_result(&self, query_id: QueryId, columns: &[String]) -> CzarResult<()> {
        self.results.insert(
            query_id,
            MemResult {
                columns: columns.to_vec(),
                ..MemResult::default()
            },
        );
        Ok(())
    }

    async fn append_bundle(
        &self,
        query_id: QueryId,
        job_id: JobId,
        attempt: AttemptCount,
        bundle: &RowBundle,
    ) -> CzarResult<()> {
        let mut result = self
            .results
            .get_mut(&query_id)
            .ok_or_else(|| CzarError::ResultStore(format!("no result table for query {query_id}")))?;
        for row in &bundle.rows {
            result.staged.push((job_id, attempt, row.clone()));
        }
        Ok(())
    }

    async fn scrub_attempt(
        &self,
        query_id: QueryId,
        job_id: JobId,
        attempt: AttemptCount,
    ) -> CzarResult<()> {
        if let Some(mut result) = self.results.get_mut(&query_id) {
            result
                .staged
                .retain(|(j, a, _)| !(*j == job_id && *a == attempt));
        }
        Ok(())
    }

    async fn finalize(
        &self,
        query_id: QueryId,
        columns: &[String],
        merge: &MergePlan,
    ) -> CzarResult<()> {
        let mut result = self
            .results
            .get_mut(&query_id)
            .ok_or_else(|| CzarError::ResultStore(format!("no result table for query {query_id}")))?;
        if merge.having.is_some() {
            return Err(CzarError::Unsupported(
                "HAVING is not evaluated by the in-memory store".to_string(),
            ));
        }
        let rows: Vec<Vec<Option<String>>> =
            result.staged.iter().map(|(_, _, cells)| cells.clone()).collect();
        let (out_columns, mut out_rows) = match &merge.mode {
            MergeMode::Passthrough => (columns.to_vec(), rows),
            MergeMode::Aggregate(merge_columns) => {
                aggregate_rows(columns, &rows, merge_columns, &merge.group_by)?
            }
        };
        if merge.distinct {
            let mut seen = std::collections::HashSet::new();
            out_rows.retain(|row| seen.insert(row.clone()));
        }
        if !merge.order_by.is_empty() {
            sort_rows(&out_columns, &mut out_rows, &merge.order_by);
        }
        if let Some(limit) = merge.limit {
            out_rows.truncate(limit as usize);
        }
        result.final_rows = Some((out_columns, out_rows));
        Ok(())
    }

    async fn fetch_result(&self, query_id: QueryId) -> CzarResult<RowBundle> {
        let result = self
            .results
            .get(&query_id)
            .ok_or_else(|| CzarError::ResultStore(format!("NO_SUCH_TABLE: {}", query_id.result_table())))?;
        let (columns, rows) = result
            .final_rows
            .clone()
            .ok_or_else(|| CzarError::ResultStore(format!("NO_SUCH_TABLE: {}", query_id.result_table())))?;
        Ok(RowBundle { columns, rows })
    }

    async fn drop_result(&self, query_id: QueryId) -> CzarResult<()> {
        self.results.remove(&query_id);
        Ok(())
    }

    async fn run_local(&self, query_id: QueryId, _sql: &str) -> CzarResult<()> {
        // No local database to run against: produce an empty result.
        if let Some(mut result) = self.results.get_mut(&query_id) {
            let columns = result.columns.clone();
            result.final_rows = Some((columns, Vec::new()));
        }
        Ok(())
    }
}

/// Execute an aggregate merge over the staged union.
fn aggregate_rows(
    columns: &[String],
    rows: &[Vec<Option<String>>],
    merge_columns: &[crate::analysis::MergeColumn],
    group_by: &[String],
) -> CzarResult<(Vec<String>, Vec<Vec<Option<String>>>)> {
    let index_of = |name: &str| -> CzarResult<usize> {
        columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| CzarError::Internal(format!("merge references unknown column {name}")))
    };
    let group_indexes: Vec<usize> = group_by
        .iter()
        .map(|g| index_of(g))
        .collect::<CzarResult<_>>()?;

    let mut groups: HashMap<Vec<Option<String>>, Vec<&Vec<Option<String>>>> = HashMap::new();
    for row in rows {
        let key: Vec<Option<String>> = group_indexes
            .iter()
            .map(|&i| row.get(i).cloned().flatten())
            .collect();
        groups.entry(key).or_default().push(row);
    }
    if groups.is_empty() && group_indexes.is_empty() {
        groups.insert(Vec::new(), Vec::new());
    }

    let out_columns: Vec<String> = merge_columns.iter().map(|c| c.output.clone()).collect();
    let mut out_rows = Vec::with_capacity(groups.len());
    for (_, members) in groups {
        let mut out_row = Vec::with_capacity(merge_columns.len());
        for column in merge_columns {
            let cell = match &column.source {
                MergeSource::Group(name) => {
                    let idx = index_of(name)?;
                    members.first().and_then(|r| r.get(idx).cloned().flatten())
                }
                MergeSource::Sum(name) => fold_numeric(&members, index_of(name)?, NumericFold::Sum),
                MergeSource::Min(name) => fold_numeric(&members, index_of(name)?, NumericFold::Min),
                MergeSource::Max(name) => fold_numeric(&members, index_of(name)?, NumericFold::Max),
                MergeSource::AvgPair { sum, count } => {
                    let total = fold_numeric(&members, index_of(sum)?, NumericFold::Sum)
                        .and_then(|v| v.parse::<f64>().ok());
                    let n = fold_numeric(&members, index_of(count)?, NumericFold::Sum)
                        .and_then(|v| v.parse::<f64>().ok());
                    match (total, n) {
                        (Some(total), Some(n)) if n > 0.0 => Some(render_number(total / n)),
                        _ => None,
                    }
                }
            };
            out_row.push(cell);
        }
        out_rows.push(out_row);
    }
    Ok((out_columns, out_rows))
}

enum NumericFold {
    Sum,
    Min,
    Max,
}

fn fold_numeric(
    rows: &[&Vec<Option<String>>],
    index: usize,
    fold: NumericFold,
) -> Option<String> {
    let mut acc: Option<f64> = None;
    for row in rows {
        let Some(Some(text)) = row.get(index) else {
            continue;
        };
        let Ok(value) = text.parse::<f64>() else {
            continue;
        };
        acc = Some(match (acc, &fold) {
            (None, _) => value,
            (Some(a), NumericFold::Sum) => a + value,
            (Some(a), NumericFold::Min) => a.min(value),
            (Some(a), NumericFold::Max) => a.max(value),
        });
    }
    acc.map(render_number)
}

fn render_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn sort_rows(columns: &[String], rows: &mut [Vec<Option<String>>], order_by: &[String]) {
    let keys: Vec<(usize, bool)> = order_by
        .iter()
        .filter_map(|clause| {
            let mut parts = clause.split_whitespace();
            let column = parts.next()?;
            let descending = parts
                .next()
                .is_some_and(|d| d.eq_ignore_ascii_case("DESC"));
            let index = columns.iter().position(|c| c == column)?;
            Some((index, descending))
        })
        .collect();
    rows.sort_by(|a, b| {
        for (index, descending) in &keys {
            let ord = compare_cells(a.get(*index), b.get(*index));
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn compare_cells(a: Option<&Option<String>>, b: Option<&Option<String>>) -> Ordering {
    let a = a.and_then(|v| v.as_deref());
    let b = b.and_then(|v| v.as_deref());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => match (x.parse::<f64>(), y.parse::<f64>()) {
            (Ok(nx), Ok(ny)) => nx.partial_cmp(&ny).unwrap_or(Ordering::Equal),
            _ => x.cmp(y),
        },
    }
}

// ---------------------------------------------------------------------------
// MySQL store
// ---------------------------------------------------------------------------

/// Store backed by the czar's MySQL instance. The union table carries two
/// extra tag columns used for attempt scrubbing.
pub struct SqlResultStore {
    pool: MySqlPool,
}

impl SqlResultStore {
    /// Connect lazily to the result database.
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

    fn union_table(query_id: QueryId) -> String {
        format!("{}_union", query_id.result_table())
    }
}

#[async_trait]
impl ResultStore for SqlResultStore {
    async fn create_result(&self, query_id: QueryId, columns: &[String]) -> CzarResult<()> {
        let cols: Vec<String> = columns
            .iter()
            .map(|c| format!("`{c}` TEXT"))
            .chain([
                "`qs_job_id` INT UNSIGNED NOT NULL".to_string(),
                "`qs_attempt` INT UNSIGNED NOT NULL".to_string(),
            ])
            .collect();
        let ddl = format!(
            "CREATE TABLE `{}` ({})",
            Self::union_table(query_id),
            cols.join(", ")
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn append_bundle(
        &self,
        query_id: QueryId,
        job_id: JobId,
        attempt: AttemptCount,
        bundle: &RowBundle,
    ) -> CzarResult<()> {
        if bundle.rows.is_empty() {
            return Ok(());
        }
        let column_list: Vec<String> = bundle.columns.iter().map(|c| format!("`{c}`")).collect();
        let mut builder: sqlx::QueryBuilder<sqlx::MySql> = sqlx::QueryBuilder::new(format!(
            "INSERT INTO `{}` ({}, `qs_job_id`, `qs_attempt`) ",
            Self::union_table(query_id),
            column_list.join(", ")
        ));
        builder.push_values(&bundle.rows, |mut b, row| {
            for cell in row {
                b.push_bind(cell.clone());
            }
            b.push_bind(job_id.0);
            b.push_bind(attempt);
        });
        builder.build().execute(&self.pool).await?;
        debug!(query_id = %query_id, job_id = %job_id, rows = bundle.rows.len(), "bundle staged");
        Ok(())
    }

    async fn scrub_attempt(
        &self,
        query_id: QueryId,
        job_id: JobId,
        attempt: AttemptCount,
    ) -> CzarResult<()> {
        let sql = format!(
            "DELETE FROM `{}` WHERE `qs_job_id` = ? AND `qs_attempt` = ?",
            Self::union_table(query_id)
        );
        sqlx::query(&sql)
            .bind(job_id.0)
            .bind(attempt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finalize(
        &self,
        query_id: QueryId,
        columns: &[String],
        merge: &MergePlan,
    ) -> CzarResult<()> {
        // Passthrough must not leak the tag columns into the final table.
        let merge_sql = match merge.mode {
            MergeMode::Passthrough => {
                let column_list: Vec<String> =
                    columns.iter().map(|c| format!("`{c}`")).collect();
                merge
                    .sql_for(&Self::union_table(query_id))
                    .replacen('*', &column_list.join(", "), 1)
            }
            MergeMode::Aggregate(_) => merge.sql_for(&Self::union_table(query_id)),
        };
        let ddl = format!(
            "CREATE TABLE `{}` AS {merge_sql}",
            query_id.result_table()
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_result(&self, query_id: QueryId) -> CzarResult<RowBundle> {
        let sql = format!("SELECT * FROM `{}`", query_id.result_table());
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut bundle = RowBundle::default();
        if let Some(first) = rows.first() {
            bundle.columns = first
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
        }
        for row in &rows {
            let cells = (0..row.columns().len())
                .map(|i| {
                    row.try_get::<Option<String>, _>(i)
                        .ok()
                        .flatten()
                        .or_else(|| {
                            row.try_get::<Option<i64>, _>(i)
                                .ok()
                                .flatten()
                                .map(|v| v.to_string())
                        })
                        .or_else(|| {
                            row.try_get::<Option<f64>, _>(i)
                                .ok()
                                .flatten()
                                .map(|v| v.to_string())
                        })
                })
                .collect();
            bundle.rows.push(cells);
        }
        Ok(bundle)
    }

    async fn drop_result(&self, query_id: QueryId) -> CzarResult<()> {
        for table in [Self::union_table(query_id), query_id.result_table()] {
            let sql = format!("DROP TABLE IF EXISTS `{table}`");
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn run_local(&self, query_id: QueryId, sql: &str) -> CzarResult<()> {
        let ddl = format!("CREATE TABLE `{}` AS {sql}", query_id.result_table());
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::MergeColumn;

    fn bundle(columns: &[&str], rows: &[&[Option<&str>]]) -> RowBundle {
        RowBundle {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|c| c.map(ToString::to_string)).collect())
                .collect(),
        }
    }

    fn count_merge() -> MergePlan {
        MergePlan {
            mode: MergeMode::Aggregate(vec![MergeColumn {
                source: MergeSource::Sum("QS1_COUNT".to_string()),
                output: "QS1_COUNT".to_string(),
            }]),
            distinct: false,
            group_by: vec![],
            having: None,
            order_by: vec![],
            limit: None,
        }
    }

    #[tokio::test]
    async fn partial_counts_sum_across_jobs() {
        let store = MemResultStore::new();
        let query = QueryId(1);
        store.create_result(query, &["QS1_COUNT".to_string()]).await.unwrap();
        store
            .append_bundle(query, JobId(0), 1, &bundle(&["QS1_COUNT"], &[&[Some("42")]]))
            .await
            .unwrap();
        store
            .append_bundle(query, JobId(1), 1, &bundle(&["QS1_COUNT"], &[&[Some("58")]]))
            .await
            .unwrap();
        store
            .finalize(query, &["QS1_COUNT".to_string()], &count_merge())
            .await
            .unwrap();

        let result = store.fetch_result(query).await.unwrap();
        assert_eq!(result.rows, vec![vec![Some("100".to_string())]]);
    }

    #[tokio::test]
    async fn scrubbing_removes_exactly_one_attempt() {
        let store = MemResultStore::new();
        let query = QueryId(2);
        store.create_result(query, &["QS1_COUNT".to_string()]).await.unwrap();
        store
            .append_bundle(query, JobId(0), 1, &bundle(&["QS1_COUNT"], &[&[Some("10")]]))
            .await
            .unwrap();
        store
            .append_bundle(query, JobId(0), 2, &bundle(&["QS1_COUNT"], &[&[Some("11")]]))
            .await
            .unwrap();

        store.scrub_attempt(query, JobId(0), 1).await.unwrap();
        let staged = store.staged_rows(query, JobId(0));
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].0, 2, "only the newer attempt survives");
    }

    #[tokio::test]
    async fn empty_union_still_merges_to_a_result() {
        let store = MemResultStore::new();
        let query = QueryId(3);
        store.create_result(query, &["QS1_COUNT".to_string()]).await.unwrap();
        store
            .finalize(query, &["QS1_COUNT".to_string()], &count_merge())
            .await
            .unwrap();
        let result = store.fetch_result(query).await.unwrap();
        assert_eq!(result.rows.len(), 1, "aggregate over empty union yields one row");
        assert_eq!(result.rows[0], vec![None]);
    }

    #[tokio::test]
    async fn dropped_result_errors_like_a_missing_table() {
        let store = MemResultStore::new();
        let query = QueryId(4);
        store.create_result(query, &["a".to_string()]).await.unwrap();
        store.drop_result(query).await.unwrap();
        let err = store.fetch_result(query).await.unwrap_err();
        assert!(err.to_string().contains("NO_SUCH_TABLE"), "{err}");
    }

    #[tokio::test]
    async fn order_and_limit_apply_after_the_union() {
        let store = MemResultStore::new();
        let query = QueryId(5);
        store.create_result(query, &["id".to_string()]).await.unwrap();
        store
            .append_bundle(
                query,
                JobId(0),
                1,
                &bundle(&["id"], &[&[Some("3")], &[Some("10")], &[Some("2")]]),
            )
            .await
            .unwrap();
        let merge = MergePlan {
            mode: MergeMode::Passthrough,
            distinct: false,
            group_by: vec![],
            having: None,
            order_by: vec!["id DESC".to_string()],
            limit: Some(2),
        };
        store.finalize(query, &["id".to_string()], &merge).await.unwrap();
        let result = store.fetch_result(query).await.unwrap();
        assert_eq!(
            result.rows,
            vec![
                vec![Some("10".to_string())],
                vec![Some("3".to_string())]
            ],
            "numeric ordering, descending, limited"
        );
    }
}
