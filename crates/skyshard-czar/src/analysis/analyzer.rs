//! Query analysis
//!
//! Turns one parsed SELECT into everything dispatch needs: the per-chunk
//! query template (plus the overlap variant when subchunking is active),
//! the merge plan that folds per-job partials into the final result, the
//! chunk-pruning regions, and the scan metadata workers schedule by.

use skyshard_catalog::{ChunkCatalog, FamilyId, Region};
use skyshard_proto::ScanTableSpec;

use crate::analysis::ast::{AggregateKind, ProjectionItem, SelectSummary, parse_select};
use crate::analysis::restrictor::AreaRestrictor;
use crate::analysis::tables::{ChunkingPlan, ResolvedTable, TableResolution, resolve};
use crate::analysis::template::{ChunkQueryTemplate, push_table_reference};
use crate::error::{CzarError, CzarResult};

/// How one merge-table column folds into the final result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeSource {
    /// Grouping column, carried through.
    Group(String),
    /// Partial counts are summed.
    Sum(String),
    Min(String),
    Max(String),
    /// Partial sum/count pair divided at merge time.
    AvgPair { sum: String, count: String },
}

/// One output column of the merge statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeColumn {
    pub source: MergeSource,
    pub output: String,
}

/// What the merge step does with the per-job union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeMode {
    /// Plain append: `INSERT INTO result SELECT * FROM <per-job-table>`.
    Passthrough,
    /// Fold aggregates (and grouping) over the union.
    Aggregate(Vec<MergeColumn>),
}

/// The merge statement in structured and textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub mode: MergeMode,
    pub distinct: bool,
    pub group_by: Vec<String>,
    pub having: Option<String>,
    pub order_by: Vec<String>,
    pub limit: Option<u64>,
}

impl MergePlan {
    /// Render the merge SQL against a concrete per-job union table.
    pub fn sql_for(&self, table: &str) -> String {
        let mut out = String::from("SELECT ");
        if self.distinct {
            out.push_str("DISTINCT ");
        }
        match &self.mode {
            MergeMode::Passthrough => out.push('*'),
            MergeMode::Aggregate(columns) => {
                let rendered: Vec<String> = columns
                    .iter()
                    .map(|c| match &c.source {
                        MergeSource::Group(col) => col.clone(),
                        MergeSource::Sum(col) => format!("SUM({col})"),
                        MergeSource::Min(col) => format!("MIN({col})"),
                        MergeSource::Max(col) => format!("MAX({col})"),
                        MergeSource::AvgPair { sum, count } => {
                            format!("SUM({sum})/SUM({count})")
                        }
                    })
                    .collect();
                out.push_str(&rendered.join(", "));
            }
        }
        out.push_str(&format!(" FROM {table}"));
        if !self.group_by.is_empty() {
            out.push_str(&format!(" GROUP BY {}", self.group_by.join(", ")));
        }
        if let Some(having) = &self.having {
            out.push_str(&format!(" HAVING {having}"));
        }
        if !self.order_by.is_empty() {
            out.push_str(&format!(" ORDER BY {}", self.order_by.join(", ")));
        }
        if let Some(limit) = self.limit {
            out.push_str(&format!(" LIMIT {limit}"));
        }
        out
    }

    /// Conventional rendering used in diagnostics and query metadata.
    pub fn sql(&self) -> String {
        self.sql_for("result")
    }
}

/// Complete analysis result for one user SELECT.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub template: ChunkQueryTemplate,
    /// Second query of a subchunked self-join, reading the overlap tables.
    pub overlap_template: Option<ChunkQueryTemplate>,
    pub plan: ChunkingPlan,
    pub family: Option<FamilyId>,
    /// Database whose chunk placement drives dispatch.
    pub dispatch_db: Option<String>,
    /// Conjunctive pruning regions from area restrictors.
    pub regions: Vec<Region>,
    pub merge: MergePlan,
    /// Column names of the per-job union (merge) table, in order.
    pub result_columns: Vec<String>,
    pub scan_tables: Vec<ScanTableSpec>,
    /// The original statement, kept for diagnostics.
    pub original_sql: String,
}

/// Analyze one SELECT against the partitioning catalog.
///
/// # Errors
/// `Syntax` for unparseable SQL, `Plan` for partitioning violations,
/// `Unsupported` for constructs outside the modeled subset.
pub async fn analyze(
    sql: &str,
    default_db: &str,
    catalog: &dyn ChunkCatalog,
) -> CzarResult<QuerySpec> {
    let summary = parse_select(sql)?;
    let resolution = resolve(&summary, default_db, catalog).await?;

    let restrictors = summary
        .restrictors
        .iter()
        .map(AreaRestrictor::from_call)
        .collect::<CzarResult<Vec<_>>>()?;
    let regions = restrictors
        .iter()
        .map(AreaRestrictor::region)
        .collect::<CzarResult<Vec<_>>>()?;

    let (worker_projection, result_columns, merge_mode) = plan_projection(&summary)?;
    let merge = MergePlan {
        mode: merge_mode,
        distinct: summary.distinct,
        group_by: summary.group_by.iter().map(|g| unqualify(g)).collect(),
        having: summary.having.as_ref().map(|h| unqualify(h)),
        order_by: summary.order_by.iter().map(|o| unqualify(o)).collect(),
        limit: summary.limit,
    };

    let scisql: Vec<String> = if restrictors.is_empty() {
        Vec::new()
    } else {
        let (table, lon, lat) = resolution.restrictor_director().ok_or_else(|| {
            CzarError::Plan(
                "area restrictor requires a director table in the FROM list".to_string(),
            )
        })?;
        let qualifier = table_qualifier(table, &resolution);
        restrictors
            .iter()
            .map(|r| r.scisql_predicate(qualifier, lon, lat))
            .collect()
    };

    let template = build_template(&summary, &resolution, &worker_projection, &scisql, false);
    let overlap_template = if resolution.plan == ChunkingPlan::ChunkAndSubchunk {
        Some(build_template(
            &summary,
            &resolution,
            &worker_projection,
            &scisql,
            true,
        ))
    } else {
        None
    };

    let dispatch_db = resolution
        .tables
        .iter()
        .find(|t| t.descriptor.is_partitioned())
        .map(|t| t.db.clone());

    let scan_tables = resolution
        .tables
        .iter()
        .filter(|t| t.descriptor.is_partitioned())
        .map(|t| ScanTableSpec {
            db: t.db.clone(),
            table: t.reference.table.clone(),
            lock_in_mem: t.descriptor.lock_in_mem(),
            scan_rating: t.descriptor.scan_rating(),
        })
        .collect();

    Ok(QuerySpec {
        template,
        overlap_template,
        plan: resolution.plan,
        family: resolution.family,
        dispatch_db,
        regions,
        merge,
        result_columns,
        scan_tables,
        original_sql: sql.to_string(),
    })
}

/// Worker projection text, merge-table column names and the merge mode.
fn plan_projection(
    summary: &SelectSummary,
) -> CzarResult<(Vec<String>, Vec<String>, MergeMode)> {
    let mut worker = Vec::with_capacity(summary.projection.len());
    let mut columns = Vec::with_capacity(summary.projection.len());
    let mut merge_columns = Vec::new();

    for (index, item) in summary.projection.iter().enumerate() {
        let position = index + 1;
        match &item.aggregate {
            None => {
                worker.push(render_projection_item(item));
                let name = column_name(item, position);
                merge_columns.push(MergeColumn {
                    source: MergeSource::Group(name.clone()),
                    output: name.clone(),
                });
                columns.push(name);
            }
            Some(agg) => match agg.kind {
                AggregateKind::Count => {
                    worker.push(render_projection_item(item));
                    let name = agg_column(item, position, "COUNT");
                    merge_columns.push(MergeColumn {
                        source: MergeSource::Sum(name.clone()),
                        output: name.clone(),
                    });
                    columns.push(name);
                }
                AggregateKind::Sum => {
                    worker.push(render_projection_item(item));
                    let name = agg_column(item, position, "SUM");
                    merge_columns.push(MergeColumn {
                        source: MergeSource::Sum(name.clone()),
                        output: name.clone(),
                    });
                    columns.push(name);
                }
                AggregateKind::Min => {
                    worker.push(render_projection_item(item));
                    let name = agg_column(item, position, "MIN");
                    merge_columns.push(MergeColumn {
                        source: MergeSource::Min(name.clone()),
                        output: name.clone(),
                    });
                    columns.push(name);
                }
                AggregateKind::Max => {
                    worker.push(render_projection_item(item));
                    let name = agg_column(item, position, "MAX");
                    merge_columns.push(MergeColumn {
                        source: MergeSource::Max(name.clone()),
                        output: name.clone(),
                    });
                    columns.push(name);
                }
                AggregateKind::Avg => {
                    // Averaging averages is wrong; ship the partial sum and
                    // count and divide at merge time.
                    if agg.arg_sql == "*" {
                        return Err(CzarError::Unsupported("AVG(*) is not valid".to_string()));
                    }
                    let sum_col = format!("QS{position}_SUM");
                    let count_col = format!("QS{position}_COUNT");
                    worker.push(format!("SUM({})", agg.arg_sql));
                    worker.push(format!("COUNT({})", agg.arg_sql));
                    merge_columns.push(MergeColumn {
                        source: MergeSource::AvgPair {
                            sum: sum_col.clone(),
                            count: count_col.clone(),
                        },
                        output: item
                            .alias
                            .clone()
                            .unwrap_or_else(|| format!("QS{position}_AVG")),
                    });
                    columns.push(sum_col);
                    columns.push(count_col);
                }
            },
        }
    }

    let mode = if summary.has_aggregates() {
        MergeMode::Aggregate(merge_columns)
    } else {
        MergeMode::Passthrough
    };
    Ok((worker, columns, mode))
}

fn render_projection_item(item: &ProjectionItem) -> String {
    match &item.alias {
        Some(alias) => format!("{} AS {alias}", item.sql),
        None => item.sql.clone(),
    }
}

/// Merge-table column name for a projection item.
fn column_name(item: &ProjectionItem, position: usize) -> String {
    item.alias
        .clone()
        .or_else(|| item.column.clone())
        .unwrap_or_else(|| format!("_{position}"))
}

fn agg_column(item: &ProjectionItem, position: usize, label: &str) -> String {
    item.alias
        .clone()
        .unwrap_or_else(|| format!("QS{position}_{label}"))
}

/// Strip table qualifiers from a clause so it resolves against the merge
/// table's bare column names.
fn unqualify(clause: &str) -> String {
    clause
        .split_whitespace()
        .map(|token| match token.rsplit_once('.') {
            Some((qualifier, column))
                if !qualifier.is_empty()
                    && qualifier.chars().all(|c| c.is_alphanumeric() || c == '_') =>
            {
                column.to_string()
            }
            _ => token.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Assemble the chunk query template.
fn build_template(
    summary: &SelectSummary,
    resolution: &TableResolution,
    worker_projection: &[String],
    scisql: &[String],
    overlap: bool,
) -> ChunkQueryTemplate {
    let mut template = ChunkQueryTemplate::new();
    template.push_text("SELECT ");
    if summary.distinct {
        template.push_text("DISTINCT ");
    }
    template.push_text(worker_projection.join(", "));
    template.push_text(" FROM ");

    let multi_table = resolution.tables.len() > 1;
    let mut seen_subchunked = false;
    for (index, table) in resolution.tables.iter().enumerate() {
        if let Some(join) = &table.reference.join {
            template.push_text(format!(" {} ", join.kind_sql));
        } else if index > 0 {
            template.push_text(", ");
        }

        let use_overlap = overlap && table.chunk_level == 2 && seen_subchunked;
        if table.chunk_level == 2 {
            seen_subchunked = true;
        }
        push_table_reference(
            &mut template,
            &table.db,
            &table.reference.table,
            table.chunk_level,
            use_overlap,
        );

        if let Some(alias) = &table.reference.alias {
            template.push_text(format!(" AS {alias}"));
        } else if multi_table {
            template.push_text(format!(" AS {}", table.reference.table));
        }

        if let Some(join) = &table.reference.join {
            if let Some(on_sql) = &join.on_sql {
                template.push_text(format!(" ON {on_sql}"));
            }
        }
    }

    let mut predicates: Vec<String> = summary.where_conjuncts.clone();
    predicates.extend(scisql.iter().cloned());
    if !predicates.is_empty() {
        template.push_text(" WHERE ");
        template.push_text(predicates.join(" AND "));
    }
    if !summary.group_by.is_empty() {
        template.push_text(format!(" GROUP BY {}", summary.group_by.join(", ")));
    }
    template
}

fn table_qualifier<'a>(table: &'a ResolvedTable, resolution: &TableResolution) -> &'a str {
    if table.reference.alias.is_none() && resolution.tables.len() == 1 {
        ""
    } else {
        table.reference.reference_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyshard_catalog::{ChunkGeometry, InMemoryCatalog, TableKey};
    use skyshard_common::ChunkId;
    use skyshard_proto::ScanRating;

    fn catalog() -> InMemoryCatalog {
        let cat = InMemoryCatalog::new();
        cat.add_family(FamilyId(1), ChunkGeometry::new(6, 3));
        cat.add_director("LSST", "Object", "id", "ra", "decl", FamilyId(1), ScanRating::Medium);
        cat.add_child(
            "LSST",
            "Source",
            "objectId",
            TableKey::new("LSST", "Object"),
            ScanRating::Slow,
        );
        cat
    }

    #[tokio::test]
    async fn count_with_box_restrictor_matches_the_canonical_form() {
        let spec = analyze(
            "SELECT COUNT(*) FROM Object WHERE qserv_areaspec_box(0,0,1,1)",
            "LSST",
            &catalog(),
        )
        .await
        .expect("analyzes");

        assert_eq!(spec.plan, ChunkingPlan::ChunkOnly);
        assert_eq!(
            spec.template.render(ChunkId(100)),
            "SELECT COUNT(*) FROM LSST.Object_100 WHERE scisql_s2PtInBox(ra,decl,0,0,1,1)=1"
        );
        assert_eq!(spec.merge.sql(), "SELECT SUM(QS1_COUNT) FROM result");
        assert_eq!(spec.result_columns, vec!["QS1_COUNT"]);
        assert_eq!(spec.regions.len(), 1);
    }

    #[tokio::test]
    async fn director_child_join_substitutes_both_tables() {
        let spec = analyze(
            "SELECT o.id, s.flux FROM Object o JOIN Source s ON o.id=s.objectId",
            "LSST",
            &catalog(),
        )
        .await
        .expect("analyzes");

        assert_eq!(spec.plan, ChunkingPlan::ChunkOnly);
        let rendered = spec.template.render(ChunkId(42));
        assert!(rendered.contains("LSST.Object_42 AS o"), "{rendered}");
        assert!(rendered.contains("LSST.Source_42 AS s"), "{rendered}");
        assert!(!rendered.contains("%SS%"), "no subchunk tokens: {rendered}");
        assert!(spec.overlap_template.is_none());
        assert_eq!(spec.merge.mode, MergeMode::Passthrough);
    }

    #[tokio::test]
    async fn self_join_generates_subchunk_and_overlap_queries() {
        let spec = analyze(
            "SELECT a.id, b.id FROM Object a JOIN Object b ON a.id=b.id WHERE a.id<>b.id",
            "LSST",
            &catalog(),
        )
        .await
        .expect("analyzes");

        assert_eq!(spec.plan, ChunkingPlan::ChunkAndSubchunk);
        let main = spec.template.text();
        assert!(
            main.contains("Subchunks_LSST_%CC%.Object_%CC%_%SS% AS a"),
            "{main}"
        );
        assert!(
            main.contains("Subchunks_LSST_%CC%.Object_%CC%_%SS% AS b"),
            "{main}"
        );

        let overlap = spec
            .overlap_template
            .as_ref()
            .expect("overlap variant")
            .text();
        assert!(
            overlap.contains("Subchunks_LSST_%CC%.Object_%CC%_%SS% AS a"),
            "{overlap}"
        );
        assert!(
            overlap.contains("Subchunks_LSST_%CC%.ObjectFullOverlap_%CC%_%SS% AS b"),
            "{overlap}"
        );
    }

    #[tokio::test]
    async fn order_by_lives_only_in_the_merge_statement() {
        let spec = analyze(
            "SELECT id FROM Object ORDER BY id DESC LIMIT 5",
            "LSST",
            &catalog(),
        )
        .await
        .expect("analyzes");

        let chunk_sql = spec.template.render(ChunkId(1));
        assert!(!chunk_sql.to_uppercase().contains("ORDER BY"), "{chunk_sql}");
        assert_eq!(
            spec.merge.sql(),
            "SELECT * FROM result ORDER BY id DESC LIMIT 5"
        );
    }

    #[tokio::test]
    async fn avg_ships_partial_sum_and_count() {
        let spec = analyze("SELECT AVG(flux) FROM Source s JOIN Object o ON s.objectId=o.id", "LSST", &catalog())
            .await
            .expect("analyzes");
        assert_eq!(spec.result_columns, vec!["QS1_SUM", "QS1_COUNT"]);
        let rendered = spec.template.render(ChunkId(1));
        assert!(rendered.contains("SUM(flux), COUNT(flux)"), "{rendered}");
        assert_eq!(
            spec.merge.sql(),
            "SELECT SUM(QS1_SUM)/SUM(QS1_COUNT) FROM result"
        );
    }

    #[tokio::test]
    async fn group_by_is_partial_on_workers_and_final_in_merge() {
        let spec = analyze(
            "SELECT id, COUNT(*) FROM Object GROUP BY id",
            "LSST",
            &catalog(),
        )
        .await
        .expect("analyzes");
        let chunk_sql = spec.template.render(ChunkId(9));
        assert!(chunk_sql.ends_with("GROUP BY id"), "{chunk_sql}");
        assert_eq!(
            spec.merge.sql(),
            "SELECT id, SUM(QS2_COUNT) FROM result GROUP BY id"
        );
    }
}
