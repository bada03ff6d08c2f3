//! Core task domain types shared between the engine and protocol adapters.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content-derived identity of a download task (hex-encoded info hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Build an identity, normalising hex digits to lowercase.
    #[must_use]
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_ascii_lowercase())
    }

    /// Borrow the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How a task's descriptor was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Minimal, reference-only descriptor; metadata is fetched from peers.
    Magnet,
    /// Complete manifest carrying the full file layout.
    Manifest,
}

impl TaskKind {
    /// Label handed to the parent controller on completion.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Magnet => "magnet",
            Self::Manifest => "torrent",
        }
    }
}

/// Raw descriptor payload as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSource {
    /// Magnet URI.
    Magnet {
        /// Magnet URI to resolve.
        uri: String,
    },
    /// Raw manifest bytes.
    Manifest {
        /// Encoded manifest payload.
        bytes: Vec<u8>,
    },
}

impl TaskSource {
    /// Convenience constructor for magnet-based sources.
    #[must_use]
    pub fn magnet(uri: impl Into<String>) -> Self {
        Self::Magnet { uri: uri.into() }
    }

    /// Convenience constructor for manifest-based sources.
    #[must_use]
    pub fn manifest(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Manifest {
            bytes: bytes.into(),
        }
    }

    /// Kind of task this source produces.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        match self {
            Self::Magnet { .. } => TaskKind::Magnet,
            Self::Manifest { .. } => TaskKind::Manifest,
        }
    }
}

/// Parsed descriptor ready to be handed to the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Content-derived identity.
    pub id: TaskId,
    /// Name shown before (and unless replaced by) metadata.
    pub display_name: String,
    /// Trackers announced by the descriptor itself.
    #[serde(default)]
    pub trackers: Vec<String>,
    /// Original descriptor payload.
    pub source: TaskSource,
}

impl TaskSpec {
    /// Kind of the underlying descriptor.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.source.kind()
    }
}

/// Transfer priority applied to a file's pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiecePriority {
    /// Do not fetch.
    None,
    /// Fetch normally.
    Normal,
}

/// Point-in-time transfer statistics for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Uploaded / downloaded payload ratio.
    pub ratio: f64,
    /// Bytes verified on disk.
    pub bytes_completed: u64,
    /// Total bytes selected for download.
    pub bytes_total: u64,
    /// Payload bytes uploaded in this session.
    pub uploaded: u64,
    /// Payload bytes downloaded in this session.
    pub downloaded: u64,
    /// Peers currently connected.
    pub active_peers: u32,
    /// Peers known to the swarm.
    pub total_peers: u32,
}

impl TaskStats {
    /// Whether every selected byte has been transferred.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.bytes_total > 0 && self.bytes_completed >= self.bytes_total
    }

    /// Completion percentage in `[0, 100]`.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            (self.bytes_completed as f64 / self.bytes_total as f64) * 100.0
        }
    }
}

/// Header obfuscation preferences for peer connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationPolicy {
    /// Prefer obfuscated handshakes.
    pub preferred: bool,
    /// Refuse peers that do not honour the preference.
    pub require_preferred: bool,
}

/// Runtime parameters used to construct a protocol engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Port accepting incoming peer connections.
    pub incoming_port: u16,
    /// Root directory for task data.
    pub download_root: PathBuf,
    /// Use memory-mapped storage for piece data.
    pub use_mmap: bool,
    /// Allow uploading to peers.
    pub enable_upload: bool,
    /// Keep seeding after completion.
    pub enable_seeding: bool,
    /// Global upload cap in bytes per second.
    pub upload_rate_limit: Option<u64>,
    /// Global download cap in bytes per second.
    pub download_rate_limit: Option<u64>,
    /// HTTP proxy used for tracker and web-seed requests.
    pub proxy_url: Option<String>,
    /// Handshake obfuscation policy.
    pub obfuscation: ObfuscationPolicy,
    /// Disable the uTP transport.
    pub disable_utp: bool,
    /// Disable IPv6 connectivity.
    pub disable_ipv6: bool,
    /// Do not contact trackers.
    pub disable_trackers: bool,
    /// Skip UPnP/NAT-PMP port forwarding.
    pub no_default_port_forwarding: bool,
    /// Silence the protocol engine's own logger.
    pub mute_engine_log: bool,
    /// Enable protocol-engine debug output.
    pub engine_debug: bool,
    /// Established peer connections per task.
    pub established_conns_per_task: u32,
    /// Half-open connections per task.
    pub half_open_conns_per_task: u32,
    /// Half-open connections across all tasks.
    pub total_half_open_conns: u32,
}

/// Completion notice handed to the parent controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTask {
    /// Filesystem path of the finished content.
    pub path: PathBuf,
    /// Task identity.
    pub task_id: TaskId,
    /// Descriptor kind.
    pub kind: TaskKind,
    /// Total payload size in bytes.
    pub size: u64,
    /// Completion timestamp.
    pub completed_at: DateTime<Utc>,
}
