//! Queue configuration loaded from environment variables.

use anyhow::{Context, Result};
use std::env;

use dotenvy::dotenv;

/// Connection and namespace settings for the queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis connection string.
    pub redis_url: String,
    /// Namespace prefix applied to every Redis key.
    pub namespace: String,
}

impl QueueConfig {
    /// Load configuration from environment variables.
    ///
    /// `REDIS_URL` defaults to a local instance; `EMBERQ_NAMESPACE` defaults
    /// to `emberq` and must be set once per process.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let namespace = env::var("EMBERQ_NAMESPACE").unwrap_or_else(|_| "emberq".to_string());

        if namespace.is_empty() {
            return Err(anyhow::anyhow!("EMBERQ_NAMESPACE must not be empty"))
                .context("invalid queue configuration");
        }

        Ok(Self {
            redis_url,
            namespace,
        })
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            namespace: "emberq".to_string(),
        }
    }
}
