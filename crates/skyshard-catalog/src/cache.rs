//! Caching layer over a chunk catalog
//!
//! Metadata lookups sit on the hot path of every user query, so descriptors,
//! geometries and per-database chunk sets are cached after first use. The
//! cache is invalidated wholesale or per database by the in-band
//! `FLUSH QSERV_CHUNKS_CACHE [FOR db]` statement.
//!
//! Placement (`worker_for`) is deliberately not cached: replica moves must
//! take effect on the next dispatch.

use async_trait::async_trait;
use dashmap::DashMap;
use skyshard_common::{ChunkId, SubchunkId};
use tracing::debug;

use crate::error::CatalogResult;
use crate::geometry::{ChunkGeometry, Region};
use crate::models::{FamilyId, TableDescriptor, TableKey, WorkerRef};
use crate::traits::ChunkCatalog;

/// Wraps any [`ChunkCatalog`] with invalidatable caches.
pub struct CachingCatalog<C> {
    inner: C,
    tables: DashMap<TableKey, TableDescriptor>,
    geometries: DashMap<FamilyId, ChunkGeometry>,
    /// Unpruned chunk sets keyed by `(db, family)`; region pruning is applied
    /// locally on the cached set.
    chunk_sets: DashMap<(String, FamilyId), Vec<ChunkId>>,
}

impl<C: ChunkCatalog> CachingCatalog<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            tables: DashMap::new(),
            geometries: DashMap::new(),
            chunk_sets: DashMap::new(),
        }
    }

    /// Drop cached entries, either for one database or for everything.
    pub fn invalidate(&self, db: Option<&str>) {
        match db {
            Some(db) => {
                debug!(db, "invalidating chunk cache for database");
                self.tables.retain(|key, _| key.db != db);
                self.chunk_sets.retain(|(cached_db, _), _| cached_db != db);
            }
            None => {
                debug!("invalidating entire chunk cache");
                self.tables.clear();
                self.geometries.clear();
                self.chunk_sets.clear();
            }
        }
    }
}

#[async_trait]
impl<C: ChunkCatalog> ChunkCatalog for CachingCatalog<C> {
    async fn table(&self, db: &str, table: &str) -> CatalogResult<TableDescriptor> {
        let key = TableKey::new(db, table);
        if let Some(hit) = self.tables.get(&key) {
            return Ok(hit.clone());
        }
        let descriptor = self.inner.table(db, table).await?;
        self.tables.insert(key, descriptor.clone());
        Ok(descriptor)
    }

    async fn geometry(&self, family: FamilyId) -> CatalogResult<ChunkGeometry> {
        if let Some(hit) = self.geometries.get(&family) {
            return Ok(*hit);
        }
        let geometry = self.inner.geometry(family).await?;
        self.geometries.insert(family, geometry);
        Ok(geometry)
    }

    async fn chunks(
        &self,
        db: &str,
        family: FamilyId,
        region: Option<&Region>,
    ) -> CatalogResult<Vec<ChunkId>> {
        let key = (db.to_string(), family);
        let full = if let Some(hit) = self.chunk_sets.get(&key) {
            hit.clone()
        } else {
            let fetched = self.inner.chunks(db, family, None).await?;
            self.chunk_sets.insert(key, fetched.clone());
            fetched
        };
        match region {
            None => Ok(full),
            Some(region) => {
                let geometry = self.geometry(family).await?;
                Ok(full
                    .into_iter()
                    .filter(|c| geometry.intersects(*c, region))
                    .collect())
            }
        }
    }

    async fn subchunks(&self, family: FamilyId) -> CatalogResult<Vec<SubchunkId>> {
        // Cheap to derive from the cached geometry.
        Ok(self.geometry(family).await?.subchunks())
    }

    async fn worker_for(&self, db: &str, chunk: ChunkId) -> CatalogResult<WorkerRef> {
        self.inner.worker_for(db, chunk).await
    }
}
