//! Typed engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validate;

/// Subdirectory of the download root that holds resume records.
pub const CACHE_DIR_NAME: &str = ".cachedTorrents";

const DEFAULT_INCOMING_PORT: i32 = 50_007;
const DEFAULT_DOWNLOAD_DIR: &str = "./downloads";
const DEFAULT_ESTABLISHED_CONNS: u32 = 50;
const DEFAULT_HALF_OPEN_CONNS: u32 = 25;
const DEFAULT_TOTAL_HALF_OPEN_CONNS: u32 = 100;

/// Immutable configuration snapshot applied when the engine is (re)configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Port accepting incoming peer connections; must be positive.
    pub incoming_port: i32,
    /// Root directory for task data and the resume cache.
    pub download_directory: PathBuf,
    /// Maximum concurrently active tasks; `0` disables the limit.
    pub max_concurrent_tasks: usize,
    /// Seed ratio after which finished tasks stop; `0` disables the policy.
    pub seed_ratio: f64,
    /// Seconds a stopped, finished task is kept before removal; `0` disables removal.
    pub remove_after_stopped_secs: u64,
    /// Start tasks automatically once metadata is known.
    pub auto_start: bool,
    /// Public trackers injected into new tasks.
    pub trackers: Vec<String>,
    /// Inject trackers even when the descriptor already announces some.
    pub always_add_trackers: bool,
    /// Allow uploading to peers.
    pub enable_upload: bool,
    /// Keep seeding after completion.
    pub enable_seeding: bool,
    /// Upload cap in bytes per second.
    pub upload_rate: Option<u64>,
    /// Download cap in bytes per second.
    pub download_rate: Option<u64>,
    /// HTTP or SOCKS proxy for tracker traffic.
    pub proxy_url: Option<String>,
    /// Prefer obfuscated peer handshakes.
    pub obfs_preferred: bool,
    /// Refuse peers that do not match the obfuscation preference.
    pub obfs_require_preferred: bool,
    /// Use memory-mapped storage.
    pub use_mmap: bool,
    /// Disable the uTP transport.
    pub disable_utp: bool,
    /// Disable IPv6 connectivity.
    pub disable_ipv6: bool,
    /// Do not contact trackers.
    pub disable_trackers: bool,
    /// Skip UPnP/NAT-PMP port forwarding.
    pub no_default_port_forwarding: bool,
    /// Silence the protocol engine logger.
    pub mute_engine_log: bool,
    /// Enable protocol engine debug output.
    pub engine_debug: bool,
    /// Established peer connections per task.
    pub established_conns_per_task: u32,
    /// Half-open connections per task.
    pub half_open_conns_per_task: u32,
    /// Half-open connections across all tasks.
    pub total_half_open_conns: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            incoming_port: DEFAULT_INCOMING_PORT,
            download_directory: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            max_concurrent_tasks: 0,
            seed_ratio: 0.0,
            remove_after_stopped_secs: 0,
            auto_start: true,
            trackers: Vec::new(),
            always_add_trackers: false,
            enable_upload: true,
            enable_seeding: true,
            upload_rate: None,
            download_rate: None,
            proxy_url: None,
            obfs_preferred: true,
            obfs_require_preferred: false,
            use_mmap: false,
            disable_utp: false,
            disable_ipv6: false,
            disable_trackers: false,
            no_default_port_forwarding: true,
            mute_engine_log: true,
            engine_debug: false,
            established_conns_per_task: DEFAULT_ESTABLISHED_CONNS,
            half_open_conns_per_task: DEFAULT_HALF_OPEN_CONNS,
            total_half_open_conns: DEFAULT_TOTAL_HALF_OPEN_CONNS,
        }
    }
}

impl EngineConfig {
    /// Check every field, returning the first violation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ConfigError::InvalidField`] naming the offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        validate::port(self.incoming_port, "incoming_port")?;
        validate::non_empty_path(&self.download_directory, "download_directory")?;
        validate::ratio(self.seed_ratio, "seed_ratio")?;
        validate::rate(self.upload_rate, "upload_rate")?;
        validate::rate(self.download_rate, "download_rate")?;
        if let Some(proxy) = &self.proxy_url {
            validate::proxy_url(proxy, "proxy_url")?;
        }
        for tracker in &self.trackers {
            validate::tracker_url(tracker, "trackers")?;
        }
        Ok(())
    }

    /// Incoming port once validated, `None` when out of range.
    #[must_use]
    pub fn listen_port(&self) -> Option<u16> {
        u16::try_from(self.incoming_port).ok().filter(|port| *port > 0)
    }

    /// Directory holding resume records under the download root.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.download_directory.join(CACHE_DIR_NAME)
    }

    /// Active-task limit, `None` when unlimited.
    #[must_use]
    pub const fn concurrency_limit(&self) -> Option<usize> {
        if self.max_concurrent_tasks > 0 {
            Some(self.max_concurrent_tasks)
        } else {
            None
        }
    }

    /// Seed ratio threshold, `None` when the policy is disabled.
    #[must_use]
    pub fn seed_ratio_threshold(&self) -> Option<f64> {
        (self.seed_ratio > 0.0).then_some(self.seed_ratio)
    }

    /// Grace period before a stopped task is removed, `None` when disabled.
    #[must_use]
    pub const fn stale_removal(&self) -> Option<Duration> {
        if self.remove_after_stopped_secs > 0 {
            Some(Duration::from_secs(self.remove_after_stopped_secs))
        } else {
            None
        }
    }
}
