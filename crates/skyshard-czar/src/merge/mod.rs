//! Reply-stream consumption and result merging.

pub mod merger;

pub use merger::{MergeOutcome, ResultMerger};
