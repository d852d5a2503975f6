//! In-memory catalog for tests and single-node deployments
//!
//! Registration methods mirror what the replication controller would publish
//! in production. The admin trait records the statements it receives so
//! tests can assert on forwarded DDL.

use async_trait::async_trait;
use dashmap::DashMap;
use skyshard_common::{ChunkId, SubchunkId};
use skyshard_proto::ScanRating;
use std::sync::Mutex;

use crate::error::{CatalogError, CatalogResult};
use crate::geometry::{ChunkGeometry, Region};
use crate::models::{
    ChildTable, DirectorTable, FamilyId, MatchTable, PlainTable, TableDescriptor, TableKey,
    WorkerRef,
};
use crate::traits::{CatalogAdmin, ChunkCatalog};

/// Catalog backed by in-process maps.
#[derive(Default)]
pub struct InMemoryCatalog {
    tables: DashMap<TableKey, TableDescriptor>,
    families: DashMap<FamilyId, ChunkGeometry>,
    /// `(db, chunk)` -> owning worker.
    placement: DashMap<(String, u32), WorkerRef>,
    /// DDL statements forwarded through the admin surface, newest last.
    admin_log: Mutex<Vec<String>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_family(&self, family: FamilyId, geometry: ChunkGeometry) {
        self.families.insert(family, geometry);
    }

    pub fn add_director(
        &self,
        db: &str,
        table: &str,
        primary_key: &str,
        lon: &str,
        lat: &str,
        family: FamilyId,
        scan_rating: ScanRating,
    ) {
        let key = TableKey::new(db, table);
        self.tables.insert(
            key.clone(),
            TableDescriptor::Director(DirectorTable {
                key,
                primary_key: primary_key.to_string(),
                lon_column: lon.to_string(),
                lat_column: lat.to_string(),
                family,
                scan_rating,
                lock_in_mem: true,
            }),
        );
    }

    pub fn add_child(
        &self,
        db: &str,
        table: &str,
        foreign_key: &str,
        director: TableKey,
        scan_rating: ScanRating,
    ) {
        let key = TableKey::new(db, table);
        self.tables.insert(
            key.clone(),
            TableDescriptor::Child(ChildTable {
                key,
                foreign_key: foreign_key.to_string(),
                director,
                scan_rating,
                lock_in_mem: true,
            }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_match(
        &self,
        db: &str,
        table: &str,
        director_first: TableKey,
        fk_first: &str,
        director_second: TableKey,
        fk_second: &str,
        scan_rating: ScanRating,
    ) {
        let key = TableKey::new(db, table);
        self.tables.insert(
            key.clone(),
            TableDescriptor::Match(MatchTable {
                key,
                director_first,
                fk_first: fk_first.to_string(),
                director_second,
                fk_second: fk_second.to_string(),
                scan_rating,
                lock_in_mem: false,
            }),
        );
    }

    pub fn add_unpartitioned(&self, db: &str, table: &str) {
        let key = TableKey::new(db, table);
        self.tables.insert(
            key.clone(),
            TableDescriptor::Unpartitioned(PlainTable {
                key,
                scan_rating: ScanRating::Fast,
            }),
        );
    }

    pub fn place_chunk(&self, db: &str, chunk: ChunkId, worker: WorkerRef) {
        self.placement.insert((db.to_string(), chunk.0), worker);
    }

    /// Chunks this catalog places on the named worker, for worker startup.
    pub fn chunks_owned_by(&self, worker_name: &str) -> Vec<(String, ChunkId)> {
        let mut owned: Vec<(String, ChunkId)> = self
            .placement
            .iter()
            .filter(|entry| entry.value().name == worker_name)
            .map(|entry| (entry.key().0.clone(), ChunkId(entry.key().1)))
            .collect();
        owned.sort();
        owned
    }

    /// DDL statements the admin surface has received, in order.
    pub fn admin_log(&self) -> Vec<String> {
        self.admin_log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChunkCatalog for InMemoryCatalog {
    async fn table(&self, db: &str, table: &str) -> CatalogResult<TableDescriptor> {
        let key = TableKey::new(db, table);
        self.tables
            .get(&key)
            .map(|entry| entry.clone())
            .ok_or_else(|| CatalogError::UnknownTable {
                db: db.to_string(),
                table: table.to_string(),
            })
    }

    async fn geometry(&self, family: FamilyId) -> CatalogResult<ChunkGeometry> {
        self.families
            .get(&family)
            .map(|entry| *entry)
            .ok_or(CatalogError::UnknownDatabase {
                db: format!("family-{}", family.0),
            })
    }

    async fn chunks(
        &self,
        db: &str,
        family: FamilyId,
        region: Option<&Region>,
    ) -> CatalogResult<Vec<ChunkId>> {
        let geometry = self.geometry(family).await?;
        let mut chunks: Vec<ChunkId> = self
            .placement
            .iter()
            .filter(|entry| entry.key().0 == db)
            .map(|entry| ChunkId(entry.key().1))
            .filter(|chunk| region.is_none_or(|r| geometry.intersects(*chunk, r)))
            .collect();
        chunks.sort();
        chunks.dedup();
        Ok(chunks)
    }

    async fn subchunks(&self, family: FamilyId) -> CatalogResult<Vec<SubchunkId>> {
        Ok(self.geometry(family).await?.subchunks())
    }

    async fn worker_for(&self, db: &str, chunk: ChunkId) -> CatalogResult<WorkerRef> {
        self.placement
            .get(&(db.to_string(), chunk.0))
            .map(|entry| entry.clone())
            .ok_or_else(|| CatalogError::NoReplica {
                db: db.to_string(),
                chunk: chunk.0,
            })
    }
}

#[async_trait]
impl CatalogAdmin for InMemoryCatalog {
    async fn drop_database(&self, db: &str) -> CatalogResult<()> {
        self.tables.retain(|key, _| key.db != db);
        self.placement.retain(|(placed_db, _), _| placed_db != db);
        if let Ok(mut log) = self.admin_log.lock() {
            log.push(format!("DROP DATABASE {db}"));
        }
        Ok(())
    }

    async fn drop_table(&self, db: &str, table: &str) -> CatalogResult<()> {
        let key = TableKey::new(db, table);
        if self.tables.remove(&key).is_none() {
            return Err(CatalogError::UnknownTable {
                db: db.to_string(),
                table: table.to_string(),
            });
        }
        if let Ok(mut log) = self.admin_log.lock() {
            log.push(format!("DROP TABLE {db}.{table}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_table_lookup_fails() {
        let cat = InMemoryCatalog::new();
        let err = cat.table("LSST", "Nope").await.unwrap_err();
        assert!(matches!(err, CatalogError::UnknownTable { .. }));
    }

    #[tokio::test]
    async fn placement_round_trips() {
        let cat = InMemoryCatalog::new();
        cat.add_family(FamilyId(1), ChunkGeometry::new(6, 3));
        let worker = WorkerRef {
            name: "w1".to_string(),
            host: "localhost".to_string(),
            port: 25002,
        };
        cat.place_chunk("LSST", ChunkId(100), worker.clone());
        cat.place_chunk("LSST", ChunkId(200), worker.clone());

        let found = cat.worker_for("LSST", ChunkId(100)).await.expect("placed");
        assert_eq!(found.name, "w1");
        assert_eq!(
            cat.chunks("LSST", FamilyId(1), None).await.expect("chunks"),
            vec![ChunkId(100), ChunkId(200)]
        );
        assert_eq!(cat.chunks_owned_by("w1").len(), 2);
    }

    #[tokio::test]
    async fn drop_database_forwards_and_unregisters() {
        let cat = InMemoryCatalog::new();
        cat.add_unpartitioned("foo", "t");
        cat.drop_database("foo").await.expect("drops");
        assert!(cat.table("foo", "t").await.is_err());
        assert_eq!(cat.admin_log(), vec!["DROP DATABASE foo".to_string()]);
    }
}
