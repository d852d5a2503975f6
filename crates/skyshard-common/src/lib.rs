//! Common utilities and patterns shared across Skyshard crates
//!
//! This crate provides shared functionality to reduce duplication across
//! the czar, worker and catalog components: identifier newtypes, the common
//! error trait, and process-wide environment initialization.

pub mod error;
pub mod id;
pub mod init;

pub use error::{CommonError, ErrorContext};
pub use id::{AttemptCount, ChunkId, CzarId, JobId, QueryId, SubchunkId};
pub use init::initialize_environment;
