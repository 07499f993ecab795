//! Proxy configuration, loaded from a JSON file or assembled in code.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cluster::VirtualCluster;
use crate::codec::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address to accept Kafka clients on.
    pub listen: String,
    /// Upstream bootstrap server, `host:port`.
    pub upstream: String,
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default)]
    pub log_frames: bool,
    #[serde(default)]
    pub log_network: bool,
    /// Per-filter-hook deadline.
    #[serde(default = "default_filter_timeout_ms")]
    pub filter_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Answer `ApiVersions` locally instead of forwarding it.
    #[serde(default = "default_true")]
    pub intercept_api_versions: bool,
    /// Watch SASL traffic to expose the authenticated identity to filters.
    /// Forces full decode until the handshake completes.
    #[serde(default)]
    pub observe_sasl: bool,
}

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_filter_timeout_ms() -> u64 {
    crate::chain::DEFAULT_HOOK_TIMEOUT.as_millis() as u64
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_true() -> bool {
    true
}

impl ProxyConfig {
    pub fn new(listen: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            upstream: upstream.into(),
            cluster_name: default_cluster_name(),
            log_frames: false,
            log_network: false,
            filter_timeout_ms: default_filter_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            intercept_api_versions: true,
            observe_sasl: false,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn filter_timeout(&self) -> Duration {
        Duration::from_millis(self.filter_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn virtual_cluster(&self) -> VirtualCluster {
        let mut cluster = VirtualCluster::new(self.cluster_name.clone());
        cluster.log_frames = self.log_frames;
        cluster.log_network = self.log_network;
        cluster
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_gets_defaults() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{"listen": "127.0.0.1:9192", "upstream": "broker:9092"}"#,
        )
        .unwrap();
        assert_eq!(config.cluster_name, "default");
        assert_eq!(config.filter_timeout(), Duration::from_secs(20));
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert!(config.intercept_api_versions);
        assert!(!config.log_frames);
    }

    #[test]
    fn knobs_can_be_overridden() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{
                "listen": "0.0.0.0:9192",
                "upstream": "broker:9092",
                "cluster_name": "staging",
                "filter_timeout_ms": 500,
                "log_frames": true,
                "intercept_api_versions": false
            }"#,
        )
        .unwrap();
        assert_eq!(config.cluster_name, "staging");
        assert_eq!(config.filter_timeout(), Duration::from_millis(500));
        assert!(config.log_frames);
        assert!(!config.intercept_api_versions);
    }
}
