//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid configuration.
//! Durations are written as integer milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the lock guarding every log mutation
pub const OP_LOG_LOCK: &str = "sp_op_log";

/// Serializes upload cycles; independent of [`OP_LOG_LOCK`] so capture keeps writing during network calls
pub const UPLOAD_LOCK: &str = "sp_op_log_upload";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpLogConfig {
    pub lock: LockConfig,
    pub capture: CaptureConfig,
    pub compaction: CompactionConfig,
    pub sync: SyncConfig,
    pub schema: SchemaConfig,
}

impl OpLogConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.capture.queue_capacity == 0 {
            anyhow::bail!("capture.queue_capacity must be positive");
        }
        if self.capture.low_water_mark >= self.capture.queue_capacity {
            anyhow::bail!("capture.low_water_mark must be below capture.queue_capacity");
        }
        if self.compaction.emergency_retention > self.compaction.retention {
            anyhow::bail!("compaction.emergency_retention must not exceed compaction.retention");
        }
        if self.schema.min_supported_version > self.schema.current_version {
            anyhow::bail!("schema.min_supported_version must not exceed schema.current_version");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockBackend {
    /// Single-process fair mutex per lock name
    InProcess,
    /// Lock files in `dir`, shared by every process using the same directory
    File { dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Lock files older than this are considered abandoned by a crashed holder
    #[serde(with = "duration_ms")]
    pub stale_after: Duration,
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::InProcess,
            poll_interval: Duration::from_millis(20),
            stale_after: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub queue_capacity: usize,
    /// Overflow warnings re-arm once the queue drains below this length
    pub low_water_mark: usize,
    #[serde(with = "duration_ms")]
    pub flush_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub flush_poll_interval: Duration,
    pub max_diff_depth: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 250,
            low_water_mark: 125,
            flush_timeout: Duration::from_secs(30),
            flush_poll_interval: Duration::from_millis(10),
            max_diff_depth: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Number of captured ops after which a compaction is triggered
    pub threshold: u64,
    #[serde(with = "duration_ms")]
    pub retention: Duration,
    #[serde(with = "duration_ms")]
    pub emergency_retention: Duration,
    #[serde(with = "duration_ms")]
    pub phase_timeout: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: 500,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            emergency_retention: Duration::from_secs(24 * 60 * 60),
            phase_timeout: Duration::from_secs(25),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub download_page_size: usize,
    pub max_rejected_ops_before_warning: usize,
    /// Failed apply attempts before a remote op is given up on
    pub max_apply_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self { Self { download_page_size: 500, max_rejected_ops_before_warning: 10, max_apply_retries: 5 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub current_version: u32,
    pub min_supported_version: u32,
    pub max_version_skip: u32,
}

impl Default for SchemaConfig {
    fn default() -> Self { Self { current_version: 1, min_supported_version: 1, max_version_skip: 5 } }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> { s.serialize_u64(d.as_millis() as u64) }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> { Ok(Duration::from_millis(u64::deserialize(d)?)) }
}
