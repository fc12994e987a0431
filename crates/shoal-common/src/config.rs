//! Cluster configuration
//!
//! Loaded from a TOML file by the daemons; every section and field has a
//! serde default so a partial file (or none at all) yields a working config.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration shared by target and gateway daemons
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub timeout: TimeoutConf,
    #[serde(default)]
    pub compression: CompressionConf,
    #[serde(default)]
    pub rebalance: RebalanceConf,
    #[serde(default)]
    pub gfn: GfnConf,
    #[serde(default)]
    pub capacity: CapacityConf,
    #[serde(default)]
    pub fshc: FshcConf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConf {
    /// Client timeout for large object transfers, seconds
    #[serde(default = "default_send_file_secs")]
    pub send_file_secs: u64,
    /// Control-plane request timeout, seconds
    #[serde(default = "default_cplane_secs")]
    pub cplane_secs: u64,
    /// Registration retry cap
    #[serde(default = "default_join_retries")]
    pub join_retries: u32,
}

fn default_send_file_secs() -> u64 {
    300
}
fn default_cplane_secs() -> u64 {
    10
}
fn default_join_retries() -> u32 {
    60
}

impl Default for TimeoutConf {
    fn default() -> Self {
        Self {
            send_file_secs: default_send_file_secs(),
            cplane_secs: default_cplane_secs(),
            join_retries: default_join_retries(),
        }
    }
}

impl TimeoutConf {
    #[must_use]
    pub fn send_file(&self) -> Duration {
        Duration::from_secs(self.send_file_secs)
    }

    #[must_use]
    pub fn cplane(&self) -> Duration {
        Duration::from_secs(self.cplane_secs)
    }
}

/// Stream-level lz4 settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressionConf {
    /// Uncompressed block max size, bytes
    #[serde(default = "default_block_max_size")]
    pub block_max_size: usize,
    /// Checksum lz4 frames on the wire
    #[serde(default)]
    pub frame_checksum: bool,
}

fn default_block_max_size() -> usize {
    256 * 1024
}

impl Default for CompressionConf {
    fn default() -> Self {
        Self {
            block_max_size: default_block_max_size(),
            frame_checksum: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RebalanceConf {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Max in-flight object moves per job
    #[serde(default = "default_reb_concurrency")]
    pub concurrency: usize,
    /// GFN window extension past the end of a mountpath operation, seconds
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_reb_concurrency() -> usize {
    8
}
fn default_grace_secs() -> u64 {
    10
}

impl Default for RebalanceConf {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            concurrency: default_reb_concurrency(),
            grace_secs: default_grace_secs(),
        }
    }
}

/// Get-from-neighbor tunables
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GfnConf {
    #[serde(default = "default_neigh_retries")]
    pub neigh_retries: u32,
    #[serde(default = "default_neigh_sleep_ms")]
    pub neigh_sleep_ms: u64,
    /// Global GFN deadline after a cluster join, seconds
    #[serde(default = "default_after_join_secs")]
    pub after_join_secs: u64,
}

fn default_neigh_retries() -> u32 {
    10
}
fn default_neigh_sleep_ms() -> u64 {
    300
}
fn default_after_join_secs() -> u64 {
    30
}

impl Default for GfnConf {
    fn default() -> Self {
        Self {
            neigh_retries: default_neigh_retries(),
            neigh_sleep_ms: default_neigh_sleep_ms(),
            after_join_secs: default_after_join_secs(),
        }
    }
}

impl GfnConf {
    #[must_use]
    pub fn neigh_sleep(&self) -> Duration {
        Duration::from_millis(self.neigh_sleep_ms)
    }

    #[must_use]
    pub fn after_join(&self) -> Duration {
        Duration::from_secs(self.after_join_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapacityConf {
    /// Used-capacity percent beyond which PUTs are rejected
    #[serde(default = "default_oos_wm")]
    pub oos_wm: i32,
    /// Housekeeping scan period, seconds
    #[serde(default = "default_cap_period_secs")]
    pub period_secs: u64,
}

fn default_oos_wm() -> i32 {
    95
}
fn default_cap_period_secs() -> u64 {
    60
}

impl Default for CapacityConf {
    fn default() -> Self {
        Self {
            oos_wm: default_oos_wm(),
            period_secs: default_cap_period_secs(),
        }
    }
}

/// Filesystem health checker thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FshcConf {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// IO errors on one mountpath before it is disabled
    #[serde(default = "default_err_limit")]
    pub err_limit: u32,
}

fn default_err_limit() -> u32 {
    5
}

impl Default for FshcConf {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            err_limit: default_err_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.gfn.neigh_retries, 10);
        assert_eq!(config.gfn.neigh_sleep_ms, 300);
        assert_eq!(config.gfn.after_join_secs, 30);
        assert_eq!(config.capacity.oos_wm, 95);
        assert!(config.rebalance.enabled);
    }

    #[test]
    fn test_partial_section() {
        let config: Config = toml::from_str("[compression]\nblock_max_size = 65536\n").unwrap();
        assert_eq!(config.compression.block_max_size, 65536);
        assert!(!config.compression.frame_checksum);
    }
}
