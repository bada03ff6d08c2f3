//! Per-task record and its state transitions.
//!
//! # Design
//! - A [`Task`] lives behind its own mutex inside a [`TaskSlot`]; the slot also
//!   carries the one-shot drop token observed by the worker.
//! - Protocol calls made while holding the task lock are synchronous, so the
//!   lock is never held across an await point that could re-enter the engine.
//! - Before metadata is known, start/stop only flip flags; the protocol handle
//!   is brought in line once metadata arrives.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kestrel_events::TaskState;
use kestrel_torrent_core::{
    CompletedTask, PiecePriority, ProtocolFile, ProtocolTask, TaskId, TaskKind, TaskSpec,
    TaskStats,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::policy::Standing;

/// Table entry: the task record plus its drop token.
pub(crate) struct TaskSlot {
    pub(crate) task: Mutex<Task>,
    pub(crate) drop_signal: CancellationToken,
}

impl TaskSlot {
    pub(crate) fn new(task: Task) -> Arc<Self> {
        Arc::new(Self {
            task: Mutex::new(task),
            drop_signal: CancellationToken::new(),
        })
    }
}

/// File inside a task, mirrored from the protocol engine.
pub(crate) struct TaskFile {
    path: String,
    size: u64,
    completed: u64,
    started: bool,
    handle: Arc<dyn ProtocolFile>,
}

/// Mutable task record.
pub(crate) struct Task {
    id: TaskId,
    name: String,
    kind: TaskKind,
    queued: bool,
    has_metadata: bool,
    started: bool,
    manual_started: bool,
    done: bool,
    all_files_done: bool,
    completion_reported: bool,
    deleted: bool,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    stats: TaskStats,
    files: Vec<TaskFile>,
    handle: Option<Arc<dyn ProtocolTask>>,
}

impl Task {
    /// Placeholder shown while the task waits for a slot.
    pub(crate) fn queued(spec: &TaskSpec) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.display_name.clone(),
            kind: spec.kind(),
            queued: true,
            has_metadata: false,
            started: false,
            manual_started: false,
            done: false,
            all_files_done: false,
            completion_reported: false,
            deleted: false,
            started_at: None,
            stopped_at: None,
            stats: TaskStats::default(),
            files: Vec::new(),
            handle: None,
        }
    }

    pub(crate) const fn is_queued(&self) -> bool {
        self.queued
    }

    /// Set once the task has been deleted; its resume record must not be
    /// written again.
    pub(crate) const fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub(crate) const fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Bind the protocol handle once admission is granted.
    pub(crate) fn admit(&mut self, spec: &TaskSpec, handle: Arc<dyn ProtocolTask>) {
        self.queued = false;
        self.kind = spec.kind();
        spec.display_name.clone_into(&mut self.name);
        self.handle = Some(handle);
    }

    pub(crate) fn state(&self) -> TaskState {
        if self.queued {
            TaskState::Queued
        } else if !self.has_metadata {
            TaskState::Pending
        } else if self.done {
            TaskState::Done
        } else if self.started {
            TaskState::Started
        } else {
            TaskState::Stopped
        }
    }

    /// Populate files from the protocol engine after metadata arrives.
    pub(crate) fn attach_metadata(&mut self) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        self.has_metadata = true;
        let name = handle.name();
        if !name.is_empty() {
            self.name = name;
        }
        let started = self.started;
        self.files = handle
            .files()
            .into_iter()
            .map(|file| TaskFile {
                path: file.path(),
                size: file.length(),
                completed: file.bytes_completed(),
                started,
                handle: file,
            })
            .collect();
        if started {
            self.apply_transfer(true);
        }
    }

    /// Start the task.
    pub(crate) fn start(&mut self) -> EngineResult<()> {
        if self.started {
            return Err(EngineError::AlreadyStarted {
                task_id: self.id.clone(),
                path: None,
            });
        }
        self.started = true;
        self.started_at = Some(Utc::now());
        for file in &mut self.files {
            file.started = true;
        }
        if self.has_metadata {
            self.apply_transfer(true);
        }
        Ok(())
    }

    /// Start the task and exempt it from ratio-driven auto-stop.
    pub(crate) fn manual_start(&mut self) -> EngineResult<()> {
        self.start()?;
        self.manual_started = true;
        Ok(())
    }

    /// Stop the task.
    pub(crate) fn stop(&mut self) -> EngineResult<()> {
        if !self.started {
            return Err(EngineError::AlreadyStopped {
                task_id: self.id.clone(),
                path: None,
            });
        }
        if self.has_metadata {
            self.apply_transfer(false);
        }
        self.started = false;
        self.stopped_at = Some(Utc::now());
        for file in &mut self.files {
            file.started = false;
        }
        Ok(())
    }

    /// Start a single file. The task's own flag is left alone.
    pub(crate) fn start_file(&mut self, path: &str) -> EngineResult<()> {
        let id = self.id.clone();
        let file = self.file_mut(path)?;
        if file.started {
            return Err(EngineError::AlreadyStarted {
                task_id: id,
                path: Some(path.to_string()),
            });
        }
        file.started = true;
        file.handle.set_priority(PiecePriority::Normal);
        Ok(())
    }

    /// Stop a single file, returning `true` when no started file remains.
    pub(crate) fn stop_file(&mut self, path: &str) -> EngineResult<bool> {
        let id = self.id.clone();
        let file = self.file_mut(path)?;
        if !file.started {
            return Err(EngineError::AlreadyStopped {
                task_id: id,
                path: Some(path.to_string()),
            });
        }
        file.started = false;
        file.handle.set_priority(PiecePriority::None);
        Ok(self.files.iter().all(|file| !file.started))
    }

    /// Pull per-file completion while some file is still incomplete.
    pub(crate) fn refresh_files(&mut self) {
        if self.all_files_done {
            return;
        }
        for file in &mut self.files {
            file.completed = file.handle.bytes_completed();
        }
        self.all_files_done =
            !self.files.is_empty() && self.files.iter().all(|file| file.completed >= file.size);
    }

    /// Pull transfer statistics. `done` never reverts once set.
    pub(crate) fn refresh_stats(&mut self) {
        let Some(handle) = &self.handle else {
            return;
        };
        self.stats = handle.stats();
        if !self.done && self.has_metadata && (self.stats.is_complete() || self.all_files_done) {
            self.done = true;
        }
    }

    /// Completion notice, produced once the first time the task is done.
    pub(crate) fn take_completion(&mut self, download_root: &std::path::Path) -> Option<CompletedTask> {
        if !self.done || self.completion_reported {
            return None;
        }
        self.completion_reported = true;
        let size = if self.stats.bytes_total > 0 {
            self.stats.bytes_total
        } else {
            self.files.iter().map(|file| file.size).sum()
        };
        Some(CompletedTask {
            path: download_root.join(&self.name),
            task_id: self.id.clone(),
            kind: self.kind,
            size,
            completed_at: Utc::now(),
        })
    }

    pub(crate) const fn standing(&self) -> Standing {
        Standing {
            ratio: self.stats.ratio,
            started: self.started,
            manual_started: self.manual_started,
            done: self.done,
            stopped_at: self.stopped_at,
        }
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            state: self.state(),
            started: self.started,
            manual_started: self.manual_started,
            done: self.done,
            all_files_done: self.all_files_done,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            seed_ratio: self.stats.ratio,
            stats: self.stats,
            files: self
                .files
                .iter()
                .map(|file| FileSnapshot {
                    path: file.path.clone(),
                    size: file.size,
                    completed: file.completed,
                    started: file.started,
                })
                .collect(),
        }
    }

    fn file_mut(&mut self, path: &str) -> EngineResult<&mut TaskFile> {
        let id = &self.id;
        self.files
            .iter_mut()
            .find(|file| file.path == path)
            .ok_or_else(|| EngineError::MissingFile {
                task_id: id.clone(),
                path: path.to_string(),
            })
    }

    fn apply_transfer(&self, enabled: bool) {
        let Some(handle) = &self.handle else {
            return;
        };
        if enabled {
            handle.allow_upload();
            handle.allow_download();
            for file in &self.files {
                file.handle.set_priority(PiecePriority::Normal);
            }
        } else {
            for file in &self.files {
                file.handle.set_priority(PiecePriority::None);
            }
            handle.disallow_upload();
            handle.disallow_download();
        }
    }
}

/// Read-only view of a file inside a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSnapshot {
    /// Path relative to the download root.
    pub path: String,
    /// Length in bytes.
    pub size: u64,
    /// Bytes verified on disk at the last refresh.
    pub completed: u64,
    /// Whether the file is selected for transfer.
    pub started: bool,
}

/// Read-only view of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    /// Task identity.
    pub id: TaskId,
    /// Display name.
    pub name: String,
    /// Descriptor kind.
    pub kind: TaskKind,
    /// Derived lifecycle state.
    pub state: TaskState,
    /// Whether the task is transferring.
    pub started: bool,
    /// Whether the last start was an explicit user request.
    pub manual_started: bool,
    /// Whether every byte has been transferred.
    pub done: bool,
    /// Whether every file reported full completion.
    pub all_files_done: bool,
    /// When the task was last started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task was last stopped.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Upload ratio reported by the protocol engine.
    pub seed_ratio: f64,
    /// Latest transfer statistics.
    pub stats: TaskStats,
    /// Files, empty until metadata is known.
    pub files: Vec<FileSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use async_trait::async_trait;
    use kestrel_torrent_core::TaskSource;

    struct FakeFile {
        path: &'static str,
        length: u64,
        completed: AtomicU64,
        normal: AtomicBool,
    }

    impl ProtocolFile for FakeFile {
        fn path(&self) -> String {
            self.path.to_string()
        }

        fn length(&self) -> u64 {
            self.length
        }

        fn bytes_completed(&self) -> u64 {
            self.completed.load(Ordering::SeqCst)
        }

        fn set_priority(&self, priority: PiecePriority) {
            self.normal
                .store(priority == PiecePriority::Normal, Ordering::SeqCst);
        }
    }

    struct FakeTask {
        files: Vec<Arc<FakeFile>>,
        upload: AtomicBool,
    }

    #[async_trait]
    impl ProtocolTask for FakeTask {
        async fn metadata_ready(&self) {}

        fn has_metadata(&self) -> bool {
            true
        }

        fn name(&self) -> String {
            "fake".into()
        }

        fn files(&self) -> Vec<Arc<dyn ProtocolFile>> {
            self.files
                .iter()
                .map(|file| Arc::clone(file) as Arc<dyn ProtocolFile>)
                .collect()
        }

        fn allow_upload(&self) {
            self.upload.store(true, Ordering::SeqCst);
        }

        fn disallow_upload(&self) {
            self.upload.store(false, Ordering::SeqCst);
        }

        fn allow_download(&self) {}

        fn disallow_download(&self) {}

        fn stats(&self) -> TaskStats {
            let total = self.files.iter().map(|file| file.length).sum();
            let completed = self.files.iter().map(|file| file.bytes_completed()).sum();
            TaskStats {
                bytes_total: total,
                bytes_completed: completed,
                ..TaskStats::default()
            }
        }

        fn release(&self) {}
    }

    fn fake_file(path: &'static str, length: u64) -> Arc<FakeFile> {
        Arc::new(FakeFile {
            path,
            length,
            completed: AtomicU64::new(0),
            normal: AtomicBool::new(false),
        })
    }

    fn admitted(files: Vec<Arc<FakeFile>>) -> (Task, Arc<FakeTask>) {
        let spec = TaskSpec {
            id: TaskId::new("ab"),
            display_name: "placeholder".into(),
            trackers: Vec::new(),
            source: TaskSource::magnet("magnet:?xt=urn:btih:ab"),
        };
        let handle = Arc::new(FakeTask {
            files,
            upload: AtomicBool::new(false),
        });
        let mut task = Task::queued(&spec);
        assert_eq!(task.state(), TaskState::Queued);
        task.admit(&spec, Arc::clone(&handle) as Arc<dyn ProtocolTask>);
        (task, handle)
    }

    #[test]
    fn start_and_stop_are_guarded() {
        let (mut task, handle) = admitted(vec![fake_file("a", 1)]);
        assert_eq!(task.state(), TaskState::Pending);
        task.attach_metadata();
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(task.snapshot().name, "fake");

        task.start().expect("first start succeeds");
        assert!(handle.upload.load(Ordering::SeqCst));
        assert!(handle.files[0].normal.load(Ordering::SeqCst));
        let before = task.snapshot();
        assert!(matches!(
            task.start(),
            Err(EngineError::AlreadyStarted { path: None, .. })
        ));
        assert_eq!(task.snapshot(), before);

        task.stop().expect("first stop succeeds");
        assert!(!handle.upload.load(Ordering::SeqCst));
        assert!(!handle.files[0].normal.load(Ordering::SeqCst));
        let before = task.snapshot();
        assert!(matches!(task.stop(), Err(EngineError::AlreadyStopped { .. })));
        assert_eq!(task.snapshot(), before);
    }

    #[test]
    fn flags_before_metadata_are_applied_on_attach() {
        let (mut task, handle) = admitted(vec![fake_file("a", 1)]);
        task.start().expect("start before metadata");
        assert!(!handle.upload.load(Ordering::SeqCst));
        task.attach_metadata();
        assert!(handle.upload.load(Ordering::SeqCst));
        assert!(task.snapshot().files[0].started);
    }

    #[test]
    fn file_level_controls_report_last_stop() {
        let (mut task, _handle) = admitted(vec![fake_file("a", 1), fake_file("b", 1)]);
        task.attach_metadata();
        task.start().expect("start");

        assert!(matches!(
            task.stop_file("missing"),
            Err(EngineError::MissingFile { .. })
        ));
        assert!(!task.stop_file("a").expect("stop a"));
        assert!(matches!(
            task.stop_file("a"),
            Err(EngineError::AlreadyStopped { path: Some(_), .. })
        ));
        assert!(task.stop_file("b").expect("stop b"));

        task.stop().expect("cascade stop");
        task.start_file("a").expect("start a");
        assert!(!task.snapshot().started, "file start leaves the task stopped");
        assert!(matches!(
            task.start_file("a"),
            Err(EngineError::AlreadyStarted { .. })
        ));
    }

    #[test]
    fn completion_is_reported_once() {
        let file = fake_file("movie.mkv", 8);
        let (mut task, _handle) = admitted(vec![Arc::clone(&file)]);
        task.attach_metadata();
        task.refresh_files();
        task.refresh_stats();
        assert!(task.take_completion(Path::new("/dl")).is_none());

        file.completed.store(8, Ordering::SeqCst);
        task.refresh_files();
        task.refresh_stats();
        assert_eq!(task.state(), TaskState::Done);
        let notice = task
            .take_completion(Path::new("/dl"))
            .expect("completion notice");
        assert_eq!(notice.path, Path::new("/dl/fake"));
        assert_eq!(notice.size, 8);
        assert_eq!(notice.kind, TaskKind::Magnet);
        assert!(task.take_completion(Path::new("/dl")).is_none());
    }
}
