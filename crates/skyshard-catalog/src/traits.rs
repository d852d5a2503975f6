//! Catalog trait seams
//!
//! The czar consults the catalog for partitioning metadata and chunk
//! placement; the worker consults it at startup to learn its chunk
//! inventory. Both depend on the traits, never on a concrete backend.

use async_trait::async_trait;
use skyshard_common::{ChunkId, SubchunkId};

use crate::error::CatalogResult;
use crate::geometry::{ChunkGeometry, Region};
use crate::models::{FamilyId, TableDescriptor, WorkerRef};

/// Read access to partitioning metadata and chunk placement.
#[async_trait]
pub trait ChunkCatalog: Send + Sync {
    /// Look up the descriptor for `db.table`.
    ///
    /// # Errors
    /// Returns `UnknownDatabase`/`UnknownTable` when the name is not
    /// registered.
    async fn table(&self, db: &str, table: &str) -> CatalogResult<TableDescriptor>;

    /// Chunk geometry shared by all directors of a family.
    async fn geometry(&self, family: FamilyId) -> CatalogResult<ChunkGeometry>;

    /// Populated chunks of a database, optionally pruned by a sky region.
    /// The result is sorted ascending.
    async fn chunks(
        &self,
        db: &str,
        family: FamilyId,
        region: Option<&Region>,
    ) -> CatalogResult<Vec<ChunkId>>;

    /// Subchunk ids valid within any chunk of the family.
    async fn subchunks(&self, family: FamilyId) -> CatalogResult<Vec<SubchunkId>>;

    /// The worker currently serving `(db, chunk)`.
    ///
    /// # Errors
    /// Returns `NoReplica` when no live worker owns the chunk.
    async fn worker_for(&self, db: &str, chunk: ChunkId) -> CatalogResult<WorkerRef>;
}

/// Forwarding surface for catalog-mutating statements the czar recognizes
/// in-band (DROP DATABASE / DROP TABLE).
#[async_trait]
pub trait CatalogAdmin: Send + Sync {
    async fn drop_database(&self, db: &str) -> CatalogResult<()>;
    async fn drop_table(&self, db: &str, table: &str) -> CatalogResult<()>;
}

// Shared handles delegate, so layers like the cache can wrap either a
// concrete backend or a trait object.
#[async_trait]
impl ChunkCatalog for std::sync::Arc<dyn ChunkCatalog> {
    async fn table(&self, db: &str, table: &str) -> CatalogResult<TableDescriptor> {
        (**self).table(db, table).await
    }

    async fn geometry(&self, family: FamilyId) -> CatalogResult<ChunkGeometry> {
        (**self).geometry(family).await
    }

    async fn chunks(
        &self,
        db: &str,
        family: FamilyId,
        region: Option<&Region>,
    ) -> CatalogResult<Vec<ChunkId>> {
        (**self).chunks(db, family, region).await
    }

    async fn subchunks(&self, family: FamilyId) -> CatalogResult<Vec<SubchunkId>> {
        (**self).subchunks(family).await
    }

    async fn worker_for(&self, db: &str, chunk: ChunkId) -> CatalogResult<WorkerRef> {
        (**self).worker_for(db, chunk).await
    }
}
