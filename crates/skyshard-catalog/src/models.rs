//! Partitioning metadata models
//!
//! Every table the engine can touch is described by a [`TableDescriptor`].
//! Directors drive the partitioning of a family; children follow their
//! director row-by-row; match tables relate two directors; unpartitioned
//! tables are replicated everywhere and never rewritten.

use serde::{Deserialize, Serialize};
use skyshard_proto::ScanRating;

/// Identifier of a partitioning family. Directors in the same family share
/// chunk geometry, which is what makes their joins chunk-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FamilyId(pub u32);

/// Fully qualified table name, the catalog's lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub db: String,
    pub table: String,
}

impl TableKey {
    pub fn new(db: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            table: table.into(),
        }
    }
}

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.db, self.table)
    }
}

/// A partitioned table whose primary key drives its family's partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorTable {
    pub key: TableKey,
    pub primary_key: String,
    pub lon_column: String,
    pub lat_column: String,
    pub family: FamilyId,
    pub scan_rating: ScanRating,
    pub lock_in_mem: bool,
}

/// A partitioned table that references a director through a foreign key and
/// lives in the same chunk as its parent row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildTable {
    pub key: TableKey,
    pub foreign_key: String,
    pub director: TableKey,
    pub scan_rating: ScanRating,
    pub lock_in_mem: bool,
}

/// A partitioned relationship between two director tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchTable {
    pub key: TableKey,
    pub director_first: TableKey,
    pub fk_first: String,
    pub director_second: TableKey,
    pub fk_second: String,
    pub scan_rating: ScanRating,
    pub lock_in_mem: bool,
}

/// A table outside the partitioning scheme, replicated to every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainTable {
    pub key: TableKey,
    pub scan_rating: ScanRating,
}

/// Sum of the four table kinds. The analyzer's admissibility matrix is a
/// pure function over pairs of these variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableDescriptor {
    Director(DirectorTable),
    Child(ChildTable),
    Match(MatchTable),
    Unpartitioned(PlainTable),
}

impl TableDescriptor {
    pub fn key(&self) -> &TableKey {
        match self {
            Self::Director(t) => &t.key,
            Self::Child(t) => &t.key,
            Self::Match(t) => &t.key,
            Self::Unpartitioned(t) => &t.key,
        }
    }

    pub fn is_partitioned(&self) -> bool {
        !matches!(self, Self::Unpartitioned(_))
    }

    pub fn scan_rating(&self) -> ScanRating {
        match self {
            Self::Director(t) => t.scan_rating,
            Self::Child(t) => t.scan_rating,
            Self::Match(t) => t.scan_rating,
            Self::Unpartitioned(t) => t.scan_rating,
        }
    }

    pub fn lock_in_mem(&self) -> bool {
        match self {
            Self::Director(t) => t.lock_in_mem,
            Self::Child(t) => t.lock_in_mem,
            Self::Match(t) => t.lock_in_mem,
            Self::Unpartitioned(_) => false,
        }
    }
}

/// Address of a worker process as published by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRef {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl WorkerRef {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
