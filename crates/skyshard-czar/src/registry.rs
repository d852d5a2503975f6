//! Worker registry client
//!
//! The registry is a small external HTTP service listing live workers. The
//! czar polls it to seed and refresh chunk placement; workers register
//! themselves at startup.

use serde::Deserialize;
use skyshard_catalog::WorkerRef;
use skyshard_config::RegistryConfig;
use tracing::debug;

use crate::error::{CzarError, CzarResult};

#[derive(Debug, Deserialize)]
struct WorkersResponse {
    success: bool,
    #[serde(default)]
    error: String,
    #[serde(default)]
    workers: Vec<WorkerEntry>,
}

#[derive(Debug, Deserialize)]
struct WorkerEntry {
    name: String,
    host: String,
    port: u16,
}

/// HTTP client for the registry's worker listing.
pub struct RegistryClient {
    base_url: String,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the current worker set.
    ///
    /// # Errors
    /// `Transport` on HTTP failure or an unsuccessful response envelope.
    pub async fn workers(&self) -> CzarResult<Vec<WorkerRef>> {
        let url = format!("{}/workers", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CzarError::Transport(format!("registry request failed: {e}")))?
            .json::<WorkersResponse>()
            .await
            .map_err(|e| CzarError::Transport(format!("registry payload invalid: {e}")))?;
        if !response.success {
            return Err(CzarError::Transport(format!(
                "registry error: {}",
                response.error
            )));
        }
        debug!(count = response.workers.len(), "registry worker listing");
        Ok(response
            .workers
            .into_iter()
            .map(|w| WorkerRef {
                name: w.name,
                host: w.host,
                port: w.port,
            })
            .collect())
    }
}
