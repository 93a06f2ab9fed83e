//! Typed configuration for the sync engine.
//!
//! The engine never reads configuration files itself; the host deserializes
//! these structs (they are plain serde types) and passes them in. Every
//! section has sensible defaults and `validate()` reports all problems at
//! once.

use serde::{Deserialize, Serialize};

/// Top-level configuration for one sync client instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub propagator: PropagatorConfig,
    pub chunks: ChunkConfig,
    pub bandwidth: BandwidthConfig,
    pub vfs: VfsConfig,
}

/// Discovery and scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between root-etag polls (overridden by server capability).
    pub poll_interval_secs: u64,
    /// Maximum age of the last full local walk before the engine stops
    /// trusting the watcher and falls back to a full walk.
    pub full_local_discovery_interval_secs: u64,
    /// Consecutive follow-up syncs allowed after `another_sync_needed`.
    pub follow_up_limit: u32,
    /// New remote directories above this size land in the undecided
    /// selective-sync list instead of being downloaded.
    pub big_folder_size_limit_mb: u64,
    /// Whether hidden files (dotfiles) are synced.
    pub sync_hidden_files: bool,
    /// Keep conflict copies out of sync. Off by default: a conflict copy
    /// normally uploads so the diverging version is visible on both sides.
    pub exclude_conflict_files: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            full_local_discovery_interval_secs: 3600,
            follow_up_limit: 3,
            big_folder_size_limit_mb: 500,
            sync_hidden_files: true,
            exclude_conflict_files: false,
        }
    }
}

/// Propagation concurrency and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagatorConfig {
    /// Concurrent jobs per root.
    pub parallelism: usize,
    /// Concurrent jobs per root when the server negotiated HTTP/2.
    pub parallelism_http2: usize,
    /// Concurrent HTTP jobs across all roots (the global job queue bound).
    pub global_job_limit: usize,
    /// Seconds for the per-request metadata timeout.
    pub metadata_timeout_secs: u64,
    /// Seconds for the per-request data-transfer timeout.
    pub transfer_timeout_secs: u64,
    /// In-run retry ladder for transient errors, in milliseconds.
    pub retry_delays_ms: Vec<u64>,
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        Self {
            parallelism: 6,
            parallelism_http2: 20,
            global_job_limit: 30,
            metadata_timeout_secs: 60,
            transfer_timeout_secs: 300,
            retry_delays_ms: vec![1_000, 2_000, 5_000, 10_000, 30_000],
        }
    }
}

/// Chunked-upload settings. Server capabilities may narrow these further.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Files at or above this size upload in chunks.
    pub chunk_threshold_bytes: u64,
    /// Target wall-clock duration of one chunk upload.
    pub target_chunk_duration_secs: u64,
    pub min_chunk_size_bytes: u64,
    pub max_chunk_size_bytes: u64,
    /// First chunk size before any duration measurement exists.
    pub initial_chunk_size_bytes: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_threshold_bytes: 10 * 1024 * 1024,
            target_chunk_duration_secs: 60,
            min_chunk_size_bytes: 1024 * 1024,
            max_chunk_size_bytes: 1024 * 1024 * 1024,
            initial_chunk_size_bytes: 10 * 1024 * 1024,
        }
    }
}

/// A transfer-rate limit for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "value")]
pub enum RateLimit {
    /// No pacing.
    #[default]
    Off,
    /// Fixed cap in kilobytes per second.
    AbsoluteKbps(u64),
    /// Percentage of the measured link throughput (1-100).
    RelativePercent(u8),
}

/// Bandwidth limits per direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    pub upload: RateLimit,
    pub download: RateLimit,
}

/// Which virtual-file strategy a root uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VfsMode {
    #[default]
    Off,
    /// Remote-only files appear as zero-byte files with a reserved suffix.
    Suffix,
    /// Platform placeholder API; optional, engine only forwards events.
    OsNative,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    pub mode: VfsMode,
}

/// A single validation problem, with the dotted path of the field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validates the configuration and returns all errors found.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut err = |field: &str, message: &str| {
            errors.push(ValidationError {
                field: field.into(),
                message: message.into(),
            });
        };

        if self.sync.poll_interval_secs == 0 {
            err("sync.poll_interval_secs", "must be greater than zero");
        }
        if self.propagator.parallelism == 0 {
            err("propagator.parallelism", "must be greater than zero");
        }
        if self.propagator.global_job_limit < self.propagator.parallelism {
            err(
                "propagator.global_job_limit",
                "must be at least propagator.parallelism",
            );
        }
        if self.chunks.min_chunk_size_bytes == 0 {
            err("chunks.min_chunk_size_bytes", "must be greater than zero");
        }
        if self.chunks.min_chunk_size_bytes > self.chunks.max_chunk_size_bytes {
            err(
                "chunks.min_chunk_size_bytes",
                "must not exceed chunks.max_chunk_size_bytes",
            );
        }
        if self.chunks.chunk_threshold_bytes == 0 {
            err("chunks.chunk_threshold_bytes", "must be greater than zero");
        }
        for (field, limit) in [
            ("bandwidth.upload", &self.bandwidth.upload),
            ("bandwidth.download", &self.bandwidth.download),
        ] {
            match limit {
                RateLimit::AbsoluteKbps(0) => err(field, "absolute limit must be non-zero"),
                RateLimit::RelativePercent(p) if *p == 0 || *p > 100 => {
                    err(field, "relative limit must be within 1-100")
                }
                _ => {}
            }
        }

        errors
    }
}
