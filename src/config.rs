use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use vnet_session_shm::{RegionBacking, SegmentManagerConfig};

/// Session layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLayerConfig {
    /// Number of dataplane worker threads; worker 0 is the main thread
    #[serde(default = "default_num_workers")]
    pub num_workers: u32,

    /// Prefix of generated segment names
    #[serde(default = "default_segment_prefix")]
    pub segment_prefix: String,

    /// Segment backing: "posix" or "anonymous"
    #[serde(default)]
    pub segment_backing: RegionBacking,

    /// Segment size when an application does not ask for one
    #[serde(default = "default_segment_size")]
    pub default_segment_size: u64,

    /// Size of segments added on FIFO exhaustion
    #[serde(default = "default_add_segment_size")]
    pub default_add_segment_size: u64,

    /// Event queue slots when an application does not ask for a size
    #[serde(default = "default_event_queue_size")]
    pub default_event_queue_size: u32,

    #[serde(default = "default_fifo_size")]
    pub default_rx_fifo_size: u32,

    #[serde(default = "default_fifo_size")]
    pub default_tx_fifo_size: u32,

    /// Largest single segment
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,

    /// Budget for all segments together
    #[serde(default = "default_max_total_segment_bytes")]
    pub max_total_segment_bytes: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_num_workers() -> u32 {
    num_cpus::get().max(1) as u32
}

fn default_segment_prefix() -> String {
    "vsession".to_string()
}

fn default_segment_size() -> u64 {
    1024 * 1024
}

fn default_add_segment_size() -> u64 {
    1024 * 1024
}

fn default_event_queue_size() -> u32 {
    2048
}

fn default_fifo_size() -> u32 {
    64 * 1024
}

fn default_max_segment_size() -> u64 {
    256 * 1024 * 1024
}

fn default_max_total_segment_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SessionLayerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            segment_prefix: default_segment_prefix(),
            segment_backing: RegionBacking::default(),
            default_segment_size: default_segment_size(),
            default_add_segment_size: default_add_segment_size(),
            default_event_queue_size: default_event_queue_size(),
            default_rx_fifo_size: default_fifo_size(),
            default_tx_fifo_size: default_fifo_size(),
            max_segment_size: default_max_segment_size(),
            max_total_segment_bytes: default_max_total_segment_bytes(),
            log_level: default_log_level(),
        }
    }
}

impl SessionLayerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read config file: {:?}", path.as_ref()))?;

        let config: SessionLayerConfig = toml::from_str(&content)
            .with_context(|| format!("Cannot parse config file: {:?}", path.as_ref()))?;

        info!("Loaded session layer config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Cannot create directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).with_context(|| "Cannot serialize config")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Cannot write config file: {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Segment manager settings derived from this configuration
    pub fn segment_manager_config(&self) -> SegmentManagerConfig {
        SegmentManagerConfig {
            name_prefix: self.segment_prefix.clone(),
            backing: self.segment_backing,
            max_segment_size: self.max_segment_size,
            max_total_bytes: self.max_total_segment_bytes,
        }
    }

    /// In-process configuration used by tests and builtin-only setups
    pub fn anonymous(num_workers: u32) -> Self {
        Self {
            num_workers,
            segment_backing: RegionBacking::Anonymous,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(&path, "num_workers = 3\nsegment_backing = \"anonymous\"\n").unwrap();

        let config = SessionLayerConfig::from_file(&path).unwrap();
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.segment_backing, RegionBacking::Anonymous);
        assert_eq!(config.default_event_queue_size, 2048);
        assert_eq!(config.segment_prefix, "vsession");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("session.toml");

        let mut config = SessionLayerConfig::anonymous(2);
        config.default_segment_size = 4 * 1024 * 1024;
        config.save_to_file(&path).unwrap();

        assert_eq!(SessionLayerConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "num_workers = \"many\"").unwrap();

        let err = SessionLayerConfig::from_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.toml"));
        assert!(SessionLayerConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_segment_manager_config() {
        let config = SessionLayerConfig::anonymous(1);
        let segments = config.segment_manager_config();
        assert_eq!(segments.backing, RegionBacking::Anonymous);
        assert_eq!(segments.name_prefix, "vsession");
    }
}
