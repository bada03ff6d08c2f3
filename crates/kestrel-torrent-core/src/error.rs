//! Error types for protocol-engine interactions.

use std::error::Error;

use thiserror::Error;

use crate::model::TaskId;

/// Primary error type for protocol-engine operations.
#[derive(Debug, Error)]
pub enum TorrentError {
    /// Operation is not supported by the underlying engine.
    #[error("protocol operation not supported")]
    Unsupported {
        /// Operation identifier.
        operation: &'static str,
    },
    /// Operation failed in the underlying engine.
    #[error("protocol operation failed")]
    OperationFailed {
        /// Operation identifier.
        operation: &'static str,
        /// Task identifier when available.
        task_id: Option<TaskId>,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl TorrentError {
    /// Wrap an engine failure with operation context.
    pub fn operation_failed(
        operation: &'static str,
        task_id: Option<TaskId>,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self::OperationFailed {
            operation,
            task_id,
            source: source.into(),
        }
    }
}

/// Convenience alias for protocol operation results.
pub type TorrentResult<T> = Result<T, TorrentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_failed_keeps_source_and_context() {
        let id = TaskId::new("ABCDEF");
        let err = TorrentError::operation_failed(
            "add_task",
            Some(id.clone()),
            anyhow::anyhow!("listener closed"),
        );
        assert_eq!(err.to_string(), "protocol operation failed");
        match err {
            TorrentError::OperationFailed {
                operation,
                task_id,
                source,
            } => {
                assert_eq!(operation, "add_task");
                assert_eq!(task_id, Some(id));
                assert_eq!(source.to_string(), "listener closed");
            }
            TorrentError::Unsupported { .. } => panic!("unexpected variant"),
        }
    }
}
