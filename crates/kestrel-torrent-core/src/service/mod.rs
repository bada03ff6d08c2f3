//! Traits implemented by protocol adapters and the parent controller.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;

use crate::model::{CompletedTask, PiecePriority, ProtocolSettings, TaskSpec, TaskStats};

/// Builds protocol engine instances from runtime settings.
#[async_trait]
pub trait ProtocolFactory: Send + Sync {
    /// Construct a fresh engine bound to the supplied settings.
    async fn construct(&self, settings: &ProtocolSettings) -> anyhow::Result<Arc<dyn ProtocolEngine>>;
}

/// A running protocol engine instance.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Hand a parsed descriptor to the engine and obtain its task handle.
    async fn add_task(&self, spec: &TaskSpec) -> anyhow::Result<Arc<dyn ProtocolTask>>;

    /// Shut the engine down, releasing listeners and storage.
    async fn close(&self);
}

/// Handle to a single task inside the protocol engine.
#[async_trait]
pub trait ProtocolTask: Send + Sync {
    /// Resolves once full metadata is known. Must be safe to await repeatedly.
    async fn metadata_ready(&self);

    /// Whether metadata is already known.
    fn has_metadata(&self) -> bool;

    /// Display name reported by the engine.
    fn name(&self) -> String;

    /// Complete encoded manifest, once metadata is known.
    fn metainfo(&self) -> Option<Vec<u8>> {
        None
    }

    /// Ordered file handles; empty until metadata is known.
    fn files(&self) -> Vec<Arc<dyn ProtocolFile>>;

    /// Number of trackers the task currently announces to.
    fn announce_count(&self) -> usize {
        0
    }

    /// Append trackers to the announce list; default implementation reports lack of support.
    fn add_trackers(&self, trackers: &[String]) -> anyhow::Result<()> {
        let _ = trackers;
        bail!("tracker injection not supported by this engine");
    }

    /// Permit uploading payload data.
    fn allow_upload(&self);

    /// Stop uploading payload data.
    fn disallow_upload(&self);

    /// Permit downloading payload data.
    fn allow_download(&self);

    /// Stop downloading payload data.
    fn disallow_download(&self);

    /// Current transfer statistics.
    fn stats(&self) -> TaskStats;

    /// Remove the task from the engine. Repeated calls are no-ops.
    fn release(&self);
}

/// Handle to a single file inside a protocol task.
pub trait ProtocolFile: Send + Sync {
    /// Path relative to the download root.
    fn path(&self) -> String;

    /// File length in bytes.
    fn length(&self) -> u64;

    /// Bytes verified on disk.
    fn bytes_completed(&self) -> u64;

    /// Change the transfer priority of every piece in the file.
    fn set_priority(&self, priority: PiecePriority);
}

/// Parser for externally supplied descriptors.
///
/// Implementations may panic on malformed input; callers are expected to guard
/// invocations accordingly.
pub trait DescriptorParser: Send + Sync {
    /// Parse a magnet URI.
    fn parse_magnet(&self, uri: &str) -> anyhow::Result<TaskSpec>;

    /// Parse a complete manifest.
    fn parse_manifest(&self, bytes: &[u8]) -> anyhow::Result<TaskSpec>;
}

/// Parent controller notified when a task finishes transferring.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    /// Report completion and receive post-processing shell commands.
    async fn on_task_done(&self, task: &CompletedTask) -> anyhow::Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BareTask;

    #[async_trait]
    impl ProtocolTask for BareTask {
        async fn metadata_ready(&self) {}

        fn has_metadata(&self) -> bool {
            true
        }

        fn name(&self) -> String {
            "bare".into()
        }

        fn files(&self) -> Vec<Arc<dyn ProtocolFile>> {
            Vec::new()
        }

        fn allow_upload(&self) {}

        fn disallow_upload(&self) {}

        fn allow_download(&self) {}

        fn disallow_download(&self) {}

        fn stats(&self) -> TaskStats {
            TaskStats::default()
        }

        fn release(&self) {}
    }

    #[tokio::test]
    async fn task_default_methods() {
        let task = BareTask;
        task.metadata_ready().await;
        assert!(task.metainfo().is_none());
        assert_eq!(task.announce_count(), 0);
        assert!(
            task.add_trackers(&["udp://tracker.example:80".into()])
                .expect_err("trackers should error")
                .to_string()
                .contains("tracker")
        );
    }
}
