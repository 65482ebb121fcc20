//! Handler configuration

mod schema;

pub use schema::{HandlerConfig, IceServer, IceTransportPolicy};

use std::path::Path;

use crate::error::Result;

impl HandlerConfig {
    /// Load configuration from a JSON file
    ///
    /// Missing fields fall back to their defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config: HandlerConfig = serde_json::from_str(&raw)?;
        tracing::debug!(
            "Loaded handler config from {} ({} ICE servers, policy {})",
            path.display(),
            config.ice_servers.len(),
            config.ice_transport_policy
        );
        Ok(config)
    }

    /// Write configuration to a JSON file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }
}
