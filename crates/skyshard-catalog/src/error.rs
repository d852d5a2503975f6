//! Catalog error types

use thiserror::Error;

/// Errors from partitioning-catalog lookups
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Database is not registered with the catalog
    #[error("Unknown database: {db}")]
    UnknownDatabase { db: String },

    /// Table is not registered with the catalog
    #[error("Unknown table: {db}.{table}")]
    UnknownTable { db: String, table: String },

    /// A child or match table references a director that is missing or of
    /// the wrong kind
    #[error("Dangling director reference: {db}.{table}")]
    DanglingDirector { db: String, table: String },

    /// No worker currently serves the requested chunk
    #[error("No replica for chunk {chunk} of database {db}")]
    NoReplica { db: String, chunk: u32 },

    /// The catalog admin backend rejected an operation
    #[error("Catalog admin error: {0}")]
    Admin(String),
}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;
