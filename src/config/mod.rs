//! Runtime configuration.
//!
//! Configuration is a serde tree loaded from a TOML file. Every field has
//! a default so a missing file still yields a runnable node (in-memory
//! repository, RAM plus disk tiers under a local root, no telemetry
//! export).
//!
//! ## Example
//!
//! ```toml
//! node_id = "stratum-1"
//!
//! [server]
//! bind_address = "127.0.0.1:7741"
//!
//! [database.sqlite]
//! path = "./stratum.db"
//!
//! [storage.ram]
//! capacity_bytes = 8589934592
//!
//! [storage.disk]
//! root_path = "./payloads"
//! capacity_bytes = 107374182400
//!
//! [spill]
//! workers = 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::{Error, Result};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Node identifier used in logs and telemetry resource attributes.
    pub node_id: String,

    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub spill: SpillConfig,
    pub leases: LeaseConfig,
    pub tiering: TieringConfig,
    pub observability: ObservabilityConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7741".to_string(),
        }
    }
}

/// Repository backend selection. Exactly one backend is active; when more
/// than one section is present the most durable wins (postgres, then
/// sqlite, then memory).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub memory: Option<MemoryDatabaseConfig>,
    pub sqlite: Option<SqliteDatabaseConfig>,
    pub postgres: Option<PostgresDatabaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MemoryDatabaseConfig {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteDatabaseConfig {
    pub path: PathBuf,
}

impl Default for SqliteDatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./stratum.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresDatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for PostgresDatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/stratum".to_string(),
            max_connections: 8,
        }
    }
}

/// Tier storage settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub ram: RamStorageConfig,
    pub disk: DiskStorageConfig,
    pub gpu: GpuStorageConfig,
    pub object: Option<ObjectStorageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RamStorageConfig {
    pub capacity_bytes: u64,
}

impl Default for RamStorageConfig {
    fn default() -> Self {
        Self {
            // 4 GiB
            capacity_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskStorageConfig {
    pub root_path: PathBuf,
    pub capacity_bytes: u64,
}

impl Default for DiskStorageConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("./payloads"),
            // 64 GiB
            capacity_bytes: 64 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GpuStorageConfig {
    /// Device ordinals to use. Empty disables the GPU tier.
    pub devices: Vec<u32>,
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStorageConfig {
    /// Base URI of the remote object endpoint, e.g.
    /// `http://minio:9000/stratum`.
    pub endpoint: String,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9000/stratum".to_string(),
        }
    }
}

/// Spill worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillConfig {
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_depth: 256,
        }
    }
}

/// Lease duration bounds, milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub default_ms: u64,
    pub max_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_ms: 30_000,
            max_ms: 300_000,
        }
    }
}

/// Tiering controller cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    pub interval_ms: u64,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

/// Telemetry switches.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
    pub tracing_enabled: bool,
    /// OTLP collector endpoint; spans are exported only when set and
    /// `tracing_enabled` is true.
    pub otlp_endpoint: Option<String>,
    /// Export transport; only "grpc" is recognized today.
    pub transport: Option<String>,
}

impl RuntimeConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidArgument(format!("config {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Parse from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| Error::InvalidArgument(format!("invalid configuration: {}", e)))
    }

    /// Whether any GPU device is configured.
    pub fn gpu_enabled(&self) -> bool {
        !self.storage.gpu.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_runnable() {
        let config = RuntimeConfig::default();
        assert_eq!(config.server.bind_address, "127.0.0.1:7741");
        assert_eq!(config.spill.workers, 2);
        assert_eq!(config.leases.default_ms, 30_000);
        assert!(!config.gpu_enabled());
        assert!(config.database.memory.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let text = r#"
            node_id = "node-a"

            [server]
            bind_address = "0.0.0.0:9000"

            [database.sqlite]
            path = "/var/lib/stratum/stratum.db"

            [storage.ram]
            capacity_bytes = 1024

            [storage.disk]
            root_path = "/var/lib/stratum/payloads"
            capacity_bytes = 2048

            [storage.gpu]
            devices = [0, 1]
            capacity_bytes = 512

            [spill]
            workers = 8
            queue_depth = 32

            [leases]
            default_ms = 1000
            max_ms = 5000

            [observability]
            tracing_enabled = true
            otlp_endpoint = "http://collector:4317"
        "#;

        let config = RuntimeConfig::from_toml(text).unwrap();
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.server.bind_address, "0.0.0.0:9000");
        assert!(config.database.sqlite.is_some());
        assert_eq!(config.storage.ram.capacity_bytes, 1024);
        assert_eq!(config.storage.gpu.devices, vec![0, 1]);
        assert!(config.gpu_enabled());
        assert_eq!(config.spill.workers, 8);
        assert_eq!(config.leases.max_ms, 5000);
        assert_eq!(
            config.observability.otlp_endpoint.as_deref(),
            Some("http://collector:4317")
        );
    }

    #[test]
    fn test_unknown_section_is_rejected_gracefully() {
        // toml-serde ignores unknown fields only when asked; the default
        // derive rejects them, which surfaces typos early.
        let text = r#"
            [serverr]
            bind_address = "x"
        "#;
        assert!(RuntimeConfig::from_toml(text).is_err());
    }

    #[test]
    fn test_empty_text_gives_defaults() {
        let config = RuntimeConfig::from_toml("").unwrap();
        assert_eq!(config.leases.max_ms, 300_000);
    }
}
