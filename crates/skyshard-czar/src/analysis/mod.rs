//! Czar-side query analysis: SELECT extraction, partitioning resolution,
//! area restrictors, chunk query templates and merge synthesis.

pub mod analyzer;
pub mod ast;
pub mod restrictor;
pub mod tables;
pub mod template;

pub use analyzer::{MergeColumn, MergeMode, MergePlan, MergeSource, QuerySpec, analyze};
pub use ast::SelectSummary;
pub use restrictor::AreaRestrictor;
pub use tables::ChunkingPlan;
pub use template::ChunkQueryTemplate;
