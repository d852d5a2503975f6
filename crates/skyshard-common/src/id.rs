//! Identifier newtypes used on both sides of the czar/worker boundary
//!
//! Every identifier that crosses the wire gets its own type so that a job id
//! cannot be confused with a chunk id at a call site. All of them are plain
//! integers on the wire.

use serde::{Deserialize, Serialize};

macro_rules! impl_display {
    ($name:ident) => {
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Process-unique, monotonically increasing user query identifier.
///
/// Assigned by the czar at submission time and carried by every task, reply
/// frame and result table derived from that query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub u64);

impl QueryId {
    /// Name of the result table for this query, e.g. `qserv_result_42`.
    pub fn result_table(&self) -> String {
        format!("qserv_result_{}", self.0)
    }
}

impl_display!(QueryId);

/// Job identifier, dense within one user query (one job per chunk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u32);

impl_display!(JobId);

/// Coarse spherical partition identifier. Non-negative by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u32);

impl_display!(ChunkId);

/// Finer partition within a chunk, used only by self-join style queries
/// over director tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubchunkId(pub u32);

impl_display!(SubchunkId);

/// Identifier of a czar process, carried by task messages so a worker can
/// tell czars apart after a czar restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CzarId(pub u32);

impl_display!(CzarId);

/// Execution attempt counter for a job. Starts at 1; retries increment.
pub type AttemptCount = u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_table_name_embeds_query_id() {
        assert_eq!(QueryId(42).result_table(), "qserv_result_42");
    }

    #[test]
    fn chunk_ids_order_numerically() {
        assert!(ChunkId(99) < ChunkId(100));
        assert!(SubchunkId(0) < SubchunkId(1));
    }
}
