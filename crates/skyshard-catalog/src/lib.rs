//! Partitioning catalog for spherically partitioned sky tables
//!
//! Maps `(database, table)` to its partitioning kind and chunk geometry, and
//! `(database, chunk)` to the worker serving it. The czar uses it to decide
//! how a query may be rewritten and where its jobs go; workers use it to
//! learn their chunk inventory at startup.

pub mod cache;
pub mod error;
pub mod geometry;
pub mod mock;
pub mod models;
pub mod traits;

pub use cache::CachingCatalog;
pub use error::{CatalogError, CatalogResult};
pub use geometry::{ChunkGeometry, Region, SphericalBox};
pub use mock::InMemoryCatalog;
pub use models::{
    ChildTable, DirectorTable, FamilyId, MatchTable, PlainTable, TableDescriptor, TableKey,
    WorkerRef,
};
pub use traits::{CatalogAdmin, ChunkCatalog};
