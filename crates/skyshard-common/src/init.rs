//! Global initialization utilities for the application

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the application environment
///
/// This should be called once at the start of a czar or worker process to
/// load environment variables from a `.env` file before configuration is
/// read.
///
/// Safe to call multiple times - will only run once
pub fn initialize_environment() {
    INIT.call_once(|| {
        // Loads from current directory or searches up the tree
        dotenvy::dotenv().ok();
    });
}
