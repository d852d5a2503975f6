//! Skyshard czar: the front-end coordinator
//!
//! Accepts user SELECTs, rewrites them against the spherical-box
//! partitioning into per-chunk sub-queries, dispatches those to the workers
//! owning each chunk, and merges the streamed partial results into a final
//! result table. In-band commands (DROP, FLUSH, SHOW PROCESSLIST, SUBMIT,
//! KILL/CANCEL) are recognized and handled without dispatch.

pub mod analysis;
pub mod czar;
pub mod dispatch;
pub mod error;
pub mod merge;
pub mod metadata;
pub mod registry;
pub mod results;
pub mod session;
pub mod status;
pub mod transport;

pub use czar::{Czar, Submission};
pub use error::{CzarError, CzarResult};
pub use session::QueryState;
