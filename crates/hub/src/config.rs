use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use backbone::{ClusterId, ComponentId, NetworkConfig};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 20099;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub bind: String,
    pub port: u16,
    pub cluster_id: ClusterId,
    /// Identity carried in the heartbeats this hub sends.
    pub component_id: ComponentId,
    pub tick_rate: u32,
    pub heartbeat_secs: u64,
    pub liveness_timeout_secs: u64,
    pub headless: bool,
    /// Global data is persisted here as JSON when set.
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval_secs: u64,
    pub network: NetworkConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            cluster_id: 0,
            component_id: 1,
            tick_rate: 100,
            heartbeat_secs: 5,
            liveness_timeout_secs: 30,
            headless: false,
            snapshot_path: None,
            snapshot_interval_secs: 60,
            network: NetworkConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }
}
