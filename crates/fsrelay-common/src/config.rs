//! Configuration types for fsrelay
//!
//! All sizing and timing knobs of a mounted volume live here. Values are
//! loaded from an optional TOML file overlaid with `FSRELAY__SECTION__KEY`
//! environment variables, then clamped by [`Config::normalized`].

use crate::error::{Error, Result};
use crate::types::MetaKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Meta-cache timeout value meaning "never expires"
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

/// Root configuration for a mounted volume
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Operation queue and exchange configuration
    pub volume: VolumeConfig,
    /// Meta-cache configuration
    pub meta: MetaConfig,
    /// Directory enumeration configuration
    pub directory: DirectoryConfig,
}

impl Config {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("FSRELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::configuration(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::configuration(e.to_string()))?;
        Ok(config.normalized())
    }

    /// Clamp every value into its supported range
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let v = &mut self.volume;
        v.transact_timeout_ms = v.transact_timeout_ms.clamp(1_000, 10_000);
        v.operation_timeout_ms = v.operation_timeout_ms.clamp(60_000, 600_000);
        v.capacity = v.capacity.clamp(100, 1_000);
        v.best_effort_capacity = v.best_effort_capacity.max(v.capacity);
        v.max_component_length = v.max_component_length.clamp(1, 255);

        let d = &mut self.directory;
        d.max_request_size = d.max_request_size.min(self.meta.item_size_max).max(4096);
        d.average_name_bytes = d.average_name_bytes.max(1);
        self
    }
}

/// Operation queue and transact exchange settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// How long an exchange waits for a pending operation (ms)
    pub transact_timeout_ms: u64,
    /// Default deadline for an operation from enqueue (ms)
    pub operation_timeout_ms: u64,
    /// Maximum Pending + Processing operations for a normal enqueue
    pub capacity: usize,
    /// Soft ceiling for best-effort enqueues
    pub best_effort_capacity: usize,
    /// Longest file name component, in characters
    pub max_component_length: usize,
    /// Compare directory names case-sensitively
    pub case_sensitive_search: bool,
}

impl VolumeConfig {
    #[must_use]
    pub const fn transact_timeout(&self) -> Duration {
        Duration::from_millis(self.transact_timeout_ms)
    }

    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            transact_timeout_ms: 1_000,
            operation_timeout_ms: 300_000, // 5 min
            capacity: 1_000,
            best_effort_capacity: 2_000,
            max_component_length: 255,
            case_sensitive_search: false,
        }
    }
}

/// Meta-cache settings, one store per [`MetaKind`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Items per store
    pub capacity: usize,
    /// Largest cacheable item (bytes)
    pub item_size_max: usize,
    /// Security descriptor lifetime (ms, 0 disables, `u64::MAX` never expires)
    pub security_timeout_ms: u64,
    /// Directory listing lifetime (ms)
    pub dir_info_timeout_ms: u64,
    /// Stream listing lifetime (ms)
    pub stream_info_timeout_ms: u64,
    /// EA list lifetime (ms)
    pub ea_timeout_ms: u64,
}

impl MetaConfig {
    /// Configured lifetime for one kind of metadata
    #[must_use]
    pub const fn timeout_ms(&self, kind: MetaKind) -> u64 {
        match kind {
            MetaKind::Security => self.security_timeout_ms,
            MetaKind::DirInfo => self.dir_info_timeout_ms,
            MetaKind::StreamInfo => self.stream_info_timeout_ms,
            MetaKind::Ea => self.ea_timeout_ms,
        }
    }

    /// A store is created only for kinds with a non-zero lifetime and a
    /// non-zero size budget
    #[must_use]
    pub const fn is_enabled(&self, kind: MetaKind) -> bool {
        self.capacity > 0 && self.item_size_max > 0 && self.timeout_ms(kind) > 0
    }
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            item_size_max: 64 * 1024, // 64 KB
            security_timeout_ms: 1_000,
            dir_info_timeout_ms: 1_000,
            stream_info_timeout_ms: 1_000,
            ea_timeout_ms: 1_000,
        }
    }
}

/// Directory enumeration settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Largest listing requested from the remote (bytes)
    pub max_request_size: usize,
    /// Assumed average name length used by the sizing ratio (bytes)
    pub average_name_bytes: usize,
    /// Send the caller's pattern to the remote for filtering
    pub pass_query_pattern: bool,
    /// Treat wildcard-free patterns as a single-name lookup
    pub allow_name_lookup: bool,
    /// Resume scans with the remote's next-offset token instead of a name
    pub marker_as_next_offset: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_request_size: 64 * 1024, // 64 KB
            average_name_bytes: 24,
            pass_query_pattern: false,
            allow_name_lookup: true,
            marker_as_next_offset: false,
        }
    }
}
