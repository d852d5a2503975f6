//! Table resolution and join admissibility
//!
//! Each FROM-list entry is resolved against the partitioning catalog and
//! assigned a chunk level: 0 for unpartitioned tables, 1 for tables that are
//! self-contained per chunk, 2 for director self-joins that need subchunking
//! and overlap tables. Equality predicates between partitioned tables must
//! be *admissible* — provably chunk-local under the partitioning — or the
//! query is rejected before any dispatch happens.

use skyshard_catalog::{ChunkCatalog, FamilyId, TableDescriptor, TableKey};

use crate::analysis::ast::{EqPredicate, SelectSummary, TableRefSummary};
use crate::error::{CzarError, CzarResult};

/// How far a query's table rewriting must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingPlan {
    /// No partitioned tables; never dispatched per chunk.
    None,
    /// Tables become `db.t_%CC%`.
    ChunkOnly,
    /// Director self-join: subchunk and overlap variants are generated.
    ChunkAndSubchunk,
}

/// A FROM-list entry with its catalog descriptor.
#[derive(Debug, Clone)]
pub struct ResolvedTable {
    pub reference: TableRefSummary,
    pub descriptor: TableDescriptor,
    pub db: String,
    /// 0, 1 or 2; see [`ChunkingPlan`].
    pub chunk_level: u8,
}

/// The resolved FROM list plus the facts the planner derives from it.
#[derive(Debug, Clone)]
pub struct TableResolution {
    pub tables: Vec<ResolvedTable>,
    /// Partitioning family shared by every partitioned table.
    pub family: Option<FamilyId>,
    pub plan: ChunkingPlan,
}

impl TableResolution {
    /// The director whose position columns anchor area restrictors: the
    /// first director in FROM order, or the first partitioned table's
    /// director.
    pub fn restrictor_director(&self) -> Option<(&ResolvedTable, &str, &str)> {
        self.tables.iter().find_map(|t| match &t.descriptor {
            TableDescriptor::Director(d) => {
                Some((t, d.lon_column.as_str(), d.lat_column.as_str()))
            }
            _ => None,
        })
    }
}

/// Outcome of the admissibility matrix for one predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admissibility {
    No,
    Yes,
    /// Director self-join on the primary key: admissible, forces
    /// subchunking on both sides.
    SelfJoin,
}

/// Resolve the FROM list and enforce the partitioning rules.
///
/// # Errors
/// `Plan` for unknown tables, mixed families, and inadmissible joins.
pub async fn resolve(
    summary: &SelectSummary,
    default_db: &str,
    catalog: &dyn ChunkCatalog,
) -> CzarResult<TableResolution> {
    if summary.tables.is_empty() {
        return Err(CzarError::Plan("query has no FROM list".to_string()));
    }

    let mut tables = Vec::with_capacity(summary.tables.len());
    for reference in &summary.tables {
        let db = reference.db.clone().unwrap_or_else(|| default_db.to_string());
        let descriptor = catalog
            .table(&db, &reference.table)
            .await
            .map_err(|e| CzarError::Plan(e.to_string()))?;
        tables.push(ResolvedTable {
            reference: reference.clone(),
            descriptor,
            db,
            chunk_level: 0,
        });
    }

    let partitioned: Vec<usize> = tables
        .iter()
        .enumerate()
        .filter(|(_, t)| t.descriptor.is_partitioned())
        .map(|(i, _)| i)
        .collect();

    if partitioned.is_empty() {
        return Ok(TableResolution {
            tables,
            family: None,
            plan: ChunkingPlan::None,
        });
    }

    for &idx in &partitioned {
        tables[idx].chunk_level = 1;
    }

    let family = shared_family(&tables, &partitioned, catalog).await?;

    // With several partitioned tables every join predicate over them must
    // be admissible, and at least one must connect them; otherwise the
    // query degenerates to a cross-chunk product we refuse to plan.
    if partitioned.len() > 1 {
        let mut connected = false;
        for predicate in &summary.join_predicates {
            let Some((a_idx, b_idx)) = predicate_tables(&tables, predicate) else {
                continue;
            };
            if !(tables[a_idx].descriptor.is_partitioned()
                && tables[b_idx].descriptor.is_partitioned())
            {
                continue;
            }
            let verdict = admissible(
                &tables[a_idx].descriptor,
                &predicate.left.column,
                &tables[b_idx].descriptor,
                &predicate.right.column,
                predicate.in_outer_on,
            );
            match verdict {
                Admissibility::No => {
                    return Err(CzarError::Plan(format!(
                        "inadmissible join predicate between {} and {}",
                        tables[a_idx].descriptor.key(),
                        tables[b_idx].descriptor.key()
                    )));
                }
                Admissibility::Yes => connected = true,
                Admissibility::SelfJoin => {
                    connected = true;
                    tables[a_idx].chunk_level = 2;
                    tables[b_idx].chunk_level = 2;
                }
            }
        }
        if !connected {
            return Err(CzarError::Plan(
                "partitioned tables are not joined by an admissible predicate".to_string(),
            ));
        }
    }

    // A single subchunked table degrades to plain chunking.
    let subchunked = tables.iter().filter(|t| t.chunk_level == 2).count();
    if subchunked == 1 {
        for table in &mut tables {
            if table.chunk_level == 2 {
                table.chunk_level = 1;
            }
        }
    }

    let plan = if tables.iter().any(|t| t.chunk_level == 2) {
        ChunkingPlan::ChunkAndSubchunk
    } else {
        ChunkingPlan::ChunkOnly
    };

    Ok(TableResolution {
        tables,
        family: Some(family),
        plan,
    })
}

/// Every partitioned table must belong to one partitioning family; that
/// family defines the chunk set the query iterates.
async fn shared_family(
    tables: &[ResolvedTable],
    partitioned: &[usize],
    catalog: &dyn ChunkCatalog,
) -> CzarResult<FamilyId> {
    let mut family: Option<FamilyId> = None;
    for &idx in partitioned {
        let table = &tables[idx];
        let this = match &table.descriptor {
            TableDescriptor::Director(d) => d.family,
            TableDescriptor::Child(c) => director_family(&c.director, catalog).await?,
            TableDescriptor::Match(m) => director_family(&m.director_first, catalog).await?,
            TableDescriptor::Unpartitioned(_) => continue,
        };
        match family {
            None => family = Some(this),
            Some(seen) if seen == this => {}
            Some(_) => {
                return Err(CzarError::Plan(format!(
                    "tables from different partitioning families cannot be joined: {}",
                    table.descriptor.key()
                )));
            }
        }
    }
    family.ok_or_else(|| CzarError::Internal("partitioned table without family".to_string()))
}

async fn director_family(key: &TableKey, catalog: &dyn ChunkCatalog) -> CzarResult<FamilyId> {
    match catalog.table(&key.db, &key.table).await {
        Ok(TableDescriptor::Director(d)) => Ok(d.family),
        Ok(_) | Err(_) => Err(CzarError::Plan(format!(
            "dangling director reference: {key}"
        ))),
    }
}

/// Map a predicate's qualifiers onto FROM-list entries. Unqualified columns
/// are not considered join predicates between partitioned tables.
fn predicate_tables(tables: &[ResolvedTable], predicate: &EqPredicate) -> Option<(usize, usize)> {
    let left = lookup(tables, predicate.left.qualifier.as_deref()?)?;
    let right = lookup(tables, predicate.right.qualifier.as_deref()?)?;
    if left == right {
        // Same reference on both sides is a tautology, not a join.
        return None;
    }
    Some((left, right))
}

fn lookup(tables: &[ResolvedTable], qualifier: &str) -> Option<usize> {
    tables.iter().position(|t| {
        t.reference.reference_name() == qualifier
            || format!("{}.{}", t.db, t.reference.table) == qualifier
    })
}

/// The admissibility matrix, a pure function of the two table kinds.
fn admissible(
    a: &TableDescriptor,
    col_a: &str,
    b: &TableDescriptor,
    col_b: &str,
    outer: bool,
) -> Admissibility {
    use TableDescriptor::{Child, Director, Match, Unpartitioned};
    match (a, b) {
        // Director-director: only a self-join on the primary key.
        (Director(x), Director(y)) => {
            if x.key == y.key && col_a == x.primary_key && col_b == y.primary_key {
                Admissibility::SelfJoin
            } else {
                Admissibility::No
            }
        }
        // Director-child: the child's director must be this director and the
        // columns must be its primary key and the child's foreign key.
        (Director(d), Child(c)) => {
            if c.director == d.key && col_a == d.primary_key && col_b == c.foreign_key {
                Admissibility::Yes
            } else {
                Admissibility::No
            }
        }
        (Child(_), Director(_)) => admissible(b, col_b, a, col_a, outer),
        // Child-child: identical director, both foreign keys.
        (Child(x), Child(y)) => {
            if x.director == y.director && col_a == x.foreign_key && col_b == y.foreign_key {
                Admissibility::Yes
            } else {
                Admissibility::No
            }
        }
        // Director-match and child-match are never admissible inside an
        // outer join's ON clause.
        (Director(d), Match(m)) => {
            if outer || col_a != d.primary_key {
                return Admissibility::No;
            }
            let first = m.director_first == d.key && col_b == m.fk_first;
            let second = m.director_second == d.key && col_b == m.fk_second;
            if first || second {
                Admissibility::Yes
            } else {
                Admissibility::No
            }
        }
        (Match(_), Director(_)) => admissible(b, col_b, a, col_a, outer),
        (Child(c), Match(m)) => {
            if outer || col_a != c.foreign_key {
                return Admissibility::No;
            }
            let first = m.director_first == c.director && col_b == m.fk_first;
            let second = m.director_second == c.director && col_b == m.fk_second;
            if first || second {
                Admissibility::Yes
            } else {
                Admissibility::No
            }
        }
        (Match(_), Child(_)) => admissible(b, col_b, a, col_a, outer),
        // Match-match joins (including self-joins) are not provably safe.
        (Match(_), Match(_)) => Admissibility::No,
        (Unpartitioned(_), _) | (_, Unpartitioned(_)) => Admissibility::Yes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ast::parse_select;
    use skyshard_catalog::{ChunkGeometry, InMemoryCatalog};
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
        cat.add_match(
            "LSST",
            "ObjectPairs",
            TableKey::new("LSST", "Object"),
            "first",
            TableKey::new("LSST", "Object"),
            "second",
            ScanRating::Medium,
        );
        cat.add_unpartitioned("LSST", "Filter");
        cat
    }

    #[tokio::test]
    async fn single_director_is_chunk_only() {
        let summary = parse_select("SELECT COUNT(*) FROM Object").unwrap();
        let resolution = resolve(&summary, "LSST", &catalog()).await.unwrap();
        assert_eq!(resolution.plan, ChunkingPlan::ChunkOnly);
        assert_eq!(resolution.tables[0].chunk_level, 1);
    }

    #[tokio::test]
    async fn unpartitioned_table_is_not_dispatched() {
        let summary = parse_select("SELECT * FROM Filter").unwrap();
        let resolution = resolve(&summary, "LSST", &catalog()).await.unwrap();
        assert_eq!(resolution.plan, ChunkingPlan::None);
    }

    #[tokio::test]
    async fn director_child_join_stays_chunk_only() {
        let summary =
            parse_select("SELECT o.id, s.flux FROM Object o JOIN Source s ON o.id=s.objectId")
                .unwrap();
        let resolution = resolve(&summary, "LSST", &catalog()).await.unwrap();
        assert_eq!(resolution.plan, ChunkingPlan::ChunkOnly);
        assert!(resolution.tables.iter().all(|t| t.chunk_level == 1));
    }

    #[tokio::test]
    async fn director_self_join_subchunks_both_sides() {
        let summary = parse_select(
            "SELECT a.id, b.id FROM Object a JOIN Object b ON a.id=b.id WHERE a.id<>b.id",
        )
        .unwrap();
        let resolution = resolve(&summary, "LSST", &catalog()).await.unwrap();
        assert_eq!(resolution.plan, ChunkingPlan::ChunkAndSubchunk);
        assert!(resolution.tables.iter().all(|t| t.chunk_level == 2));
    }

    #[tokio::test]
    async fn non_key_join_is_rejected() {
        let summary =
            parse_select("SELECT * FROM Object o JOIN Source s ON o.ra=s.objectId").unwrap();
        let err = resolve(&summary, "LSST", &catalog()).await.unwrap_err();
        assert!(matches!(err, CzarError::Plan(_)));
    }

    #[tokio::test]
    async fn unconnected_partitioned_tables_are_rejected() {
        let summary = parse_select("SELECT * FROM Object o, Source s").unwrap();
        let err = resolve(&summary, "LSST", &catalog()).await.unwrap_err();
        assert!(matches!(err, CzarError::Plan(_)));
    }

    #[tokio::test]
    async fn match_self_join_is_rejected() {
        let summary = parse_select(
            "SELECT * FROM ObjectPairs a JOIN ObjectPairs b ON a.first=b.first",
        )
        .unwrap();
        let err = resolve(&summary, "LSST", &catalog()).await.unwrap_err();
        assert!(matches!(err, CzarError::Plan(_)));
    }

    #[tokio::test]
    async fn director_match_join_is_admissible_inner_only() {
        let summary = parse_select(
            "SELECT * FROM Object o JOIN ObjectPairs p ON o.id=p.first",
        )
        .unwrap();
        let resolution = resolve(&summary, "LSST", &catalog()).await.unwrap();
        assert_eq!(resolution.plan, ChunkingPlan::ChunkOnly);

        let outer = parse_select(
            "SELECT * FROM Object o LEFT JOIN ObjectPairs p ON o.id=p.first",
        )
        .unwrap();
        let err = resolve(&outer, "LSST", &catalog()).await.unwrap_err();
        assert!(matches!(err, CzarError::Plan(_)));
    }

    #[tokio::test]
    async fn unknown_table_is_a_plan_error() {
        let summary = parse_select("SELECT * FROM Mystery").unwrap();
        let err = resolve(&summary, "LSST", &catalog()).await.unwrap_err();
        assert!(matches!(err, CzarError::Plan(_)));
    }
}
