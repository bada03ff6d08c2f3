//! FIFO wait list bounding the number of concurrently active tasks.
//!
//! The list itself holds no task data beyond identity and kind; the
//! descriptor is reloaded from the resume cache when the entry is admitted.

use std::collections::VecDeque;

use kestrel_torrent_core::{TaskId, TaskKind};

use crate::error::{EngineError, EngineResult};

/// Queued admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitEntry {
    /// Task identity.
    pub id: TaskId,
    /// Descriptor kind recorded when the task was queued.
    pub kind: TaskKind,
}

/// Admission controller state.
#[derive(Debug, Default)]
pub struct WaitList {
    limit: Option<usize>,
    entries: VecDeque<WaitEntry>,
}

impl WaitList {
    /// Empty list with the given active-task limit (`None` = unlimited).
    #[must_use]
    pub const fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            entries: VecDeque::new(),
        }
    }

    /// Whether another task may become active given `active` running tasks.
    #[must_use]
    pub fn is_ready(&self, active: usize) -> bool {
        self.limit.is_none_or(|limit| active < limit)
    }

    /// Append an entry, returning its zero-based position.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyExists`] when the identity is already queued.
    pub fn enqueue(&mut self, id: TaskId, kind: TaskKind) -> EngineResult<usize> {
        if self.contains(&id) {
            return Err(EngineError::AlreadyExists { task_id: id });
        }
        self.entries.push_back(WaitEntry { id, kind });
        Ok(self.entries.len() - 1)
    }

    /// Remove and return the oldest entry.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WaitListEmpty`] when nothing is queued.
    pub fn dequeue_next(&mut self) -> EngineResult<WaitEntry> {
        self.entries.pop_front().ok_or(EngineError::WaitListEmpty)
    }

    /// Remove an arbitrary entry; absent identities are ignored.
    pub fn remove(&mut self, id: &TaskId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| &entry.id != id);
        self.entries.len() != before
    }

    /// Whether the identity is queued.
    #[must_use]
    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.iter().any(|entry| &entry.id == id)
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the active-task limit.
    pub const fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Current active-task limit.
    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Queued identities in admission order.
    #[must_use]
    pub fn ids(&self) -> Vec<TaskId> {
        self.entries.iter().map(|entry| entry.id.clone()).collect()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
