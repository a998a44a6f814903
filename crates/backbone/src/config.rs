use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::message::DEFAULT_MAX_MESSAGE_LEN;
use crate::reliable::ReliableConfig;

/// What to do with a TLS client hello on a plaintext listener. Either way
/// the connection is dropped; TLS itself is never terminated here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    /// Drop and log the detected version at warn level.
    #[default]
    Reject,
    /// Drop with only a debug log.
    RejectQuietly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub buffer_capacity: usize,
    pub buffer_pool_size: usize,
    pub bundle_pool_size: usize,
    /// Connections accepted per listener per tick.
    pub accept_cap: usize,
    /// Reads drained from one channel per tick.
    pub recv_batch: usize,
    pub send_failure_threshold: u32,
    pub internal_inactivity_secs: u64,
    pub external_inactivity_secs: u64,
    /// How long a condemned channel may keep draining before it is dropped.
    pub condemn_grace_ms: u64,
    pub max_message_len: usize,
    pub websocket: bool,
    pub tls_policy: TlsPolicy,
    pub connect_timeout_ms: u64,
    pub reliable: ReliableConfig,
    pub worker_threads: usize,
    pub worker_max_in_flight: usize,
    pub report_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            buffer_pool_size: 1024,
            bundle_pool_size: 256,
            accept_cap: 256,
            recv_batch: 16,
            send_failure_threshold: 10,
            internal_inactivity_secs: 60,
            external_inactivity_secs: 30,
            condemn_grace_ms: 5000,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            websocket: true,
            tls_policy: TlsPolicy::Reject,
            connect_timeout_ms: 3000,
            reliable: ReliableConfig::default(),
            worker_threads: 4,
            worker_max_in_flight: 256,
            report_interval_secs: 10,
        }
    }
}

impl NetworkConfig {
    pub fn internal_inactivity(&self) -> Duration {
        Duration::from_secs(self.internal_inactivity_secs)
    }

    pub fn external_inactivity(&self) -> Duration {
        Duration::from_secs(self.external_inactivity_secs)
    }

    pub fn condemn_grace(&self) -> Duration {
        Duration::from_millis(self.condemn_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}
