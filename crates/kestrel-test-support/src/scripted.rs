//! In-memory protocol engine driven by the test body.
//!
//! Magnet tasks stay metadata-less until [`ScriptedTask::resolve`] is called;
//! manifest tasks built from a [`FixtureManifest`] resolve immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, bail};
use async_trait::async_trait;
use kestrel_torrent_core::{
    PiecePriority, ProtocolEngine, ProtocolFactory, ProtocolFile, ProtocolSettings, ProtocolTask,
    TaskId, TaskSource, TaskSpec, TaskStats,
};
use tokio::sync::watch;

use crate::fixtures::FixtureManifest;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("scripted engine mutex poisoned")
}

/// Factory handing out [`ScriptedEngine`] instances.
#[derive(Default)]
pub struct ScriptedFactory {
    failures_remaining: AtomicUsize,
    construct_calls: AtomicUsize,
    engines: Mutex<Vec<Arc<ScriptedEngine>>>,
}

impl ScriptedFactory {
    /// Factory whose constructions always succeed.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Factory that fails the first `count` constructions.
    #[must_use]
    pub fn failing(count: usize) -> Arc<Self> {
        let factory = Self::default();
        factory.failures_remaining.store(count, Ordering::SeqCst);
        Arc::new(factory)
    }

    /// Number of construction attempts so far.
    #[must_use]
    pub fn construct_calls(&self) -> usize {
        self.construct_calls.load(Ordering::SeqCst)
    }

    /// Most recently constructed engine.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<ScriptedEngine>> {
        lock(&self.engines).last().cloned()
    }

    /// Every engine constructed so far, oldest first.
    #[must_use]
    pub fn engines(&self) -> Vec<Arc<ScriptedEngine>> {
        lock(&self.engines).clone()
    }
}

#[async_trait]
impl ProtocolFactory for ScriptedFactory {
    async fn construct(&self, settings: &ProtocolSettings) -> Result<Arc<dyn ProtocolEngine>> {
        self.construct_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            bail!("listener on port {} unavailable", settings.incoming_port);
        }
        let engine = Arc::new(ScriptedEngine::new(settings.clone()));
        lock(&self.engines).push(Arc::clone(&engine));
        Ok(engine)
    }
}

/// Protocol engine that records every interaction.
pub struct ScriptedEngine {
    settings: ProtocolSettings,
    closed: AtomicBool,
    reject_adds: AtomicBool,
    added: Mutex<Vec<TaskSpec>>,
    tasks: Mutex<HashMap<TaskId, Arc<ScriptedTask>>>,
}

impl ScriptedEngine {
    /// Engine bound to `settings`.
    #[must_use]
    pub fn new(settings: ProtocolSettings) -> Self {
        Self {
            settings,
            closed: AtomicBool::new(false),
            reject_adds: AtomicBool::new(false),
            added: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Settings the engine was constructed with.
    #[must_use]
    pub const fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// Whether [`ProtocolEngine::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make subsequent `add_task` calls fail.
    pub fn reject_adds(&self, reject: bool) {
        self.reject_adds.store(reject, Ordering::SeqCst);
    }

    /// Identities handed to the engine, in order.
    #[must_use]
    pub fn added_ids(&self) -> Vec<TaskId> {
        lock(&self.added).iter().map(|spec| spec.id.clone()).collect()
    }

    /// Handle for a task previously added.
    #[must_use]
    pub fn task(&self, id: &TaskId) -> Option<Arc<ScriptedTask>> {
        lock(&self.tasks).get(id).cloned()
    }

    /// Tasks added and not yet released.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        lock(&self.tasks)
            .values()
            .filter(|task| task.release_count() == 0)
            .count()
    }
}

#[async_trait]
impl ProtocolEngine for ScriptedEngine {
    async fn add_task(&self, spec: &TaskSpec) -> Result<Arc<dyn ProtocolTask>> {
        if self.is_closed() {
            bail!("engine closed");
        }
        if self.reject_adds.load(Ordering::SeqCst) {
            bail!("engine refused task {}", spec.id);
        }
        let task = Arc::new(ScriptedTask::new(
            spec.id.clone(),
            &spec.display_name,
            spec.trackers.len(),
        ));
        if let TaskSource::Manifest { bytes } = &spec.source
            && let Ok(manifest) = FixtureManifest::decode(bytes)
        {
            task.resolve_with(&manifest.name, &manifest.files, bytes.clone());
        }
        lock(&self.added).push(spec.clone());
        lock(&self.tasks).insert(spec.id.clone(), Arc::clone(&task));
        Ok(task)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Task handle whose metadata and progress are set by the test.
pub struct ScriptedTask {
    id: TaskId,
    name: Mutex<String>,
    metadata: watch::Sender<bool>,
    metainfo: Mutex<Option<Vec<u8>>>,
    metainfo_gate: Mutex<Option<Receiver<()>>>,
    metainfo_reads: AtomicUsize,
    metadata_waits: AtomicUsize,
    files: Mutex<Vec<Arc<ScriptedFile>>>,
    announce: Mutex<Vec<String>>,
    stats: Mutex<TaskStats>,
    upload_allowed: AtomicBool,
    download_allowed: AtomicBool,
    released: AtomicUsize,
}

impl ScriptedTask {
    fn new(id: TaskId, name: &str, announce_count: usize) -> Self {
        let (metadata, _) = watch::channel(false);
        Self {
            id,
            name: Mutex::new(name.to_string()),
            metadata,
            metainfo: Mutex::new(None),
            metainfo_gate: Mutex::new(None),
            metainfo_reads: AtomicUsize::new(0),
            metadata_waits: AtomicUsize::new(0),
            files: Mutex::new(Vec::new()),
            announce: Mutex::new(vec![String::new(); announce_count]),
            stats: Mutex::new(TaskStats::default()),
            upload_allowed: AtomicBool::new(false),
            download_allowed: AtomicBool::new(false),
            released: AtomicUsize::new(0),
        }
    }

    /// Deliver metadata for a magnet task.
    pub fn resolve(&self, name: &str, files: &[(&str, u64)]) {
        let files: Vec<(String, u64)> = files
            .iter()
            .map(|(path, length)| ((*path).to_string(), *length))
            .collect();
        let mut manifest = FixtureManifest::new(self.id.as_str(), name);
        manifest.files.clone_from(&files);
        self.resolve_with(name, &files, manifest.encode());
    }

    fn resolve_with(&self, name: &str, files: &[(String, u64)], metainfo: Vec<u8>) {
        name.clone_into(&mut lock(&self.name));
        *lock(&self.files) = files
            .iter()
            .map(|(path, length)| Arc::new(ScriptedFile::new(path, *length)))
            .collect();
        *lock(&self.metainfo) = Some(metainfo);
        let total = files.iter().map(|(_, length)| length).sum();
        lock(&self.stats).bytes_total = total;
        self.metadata.send_replace(true);
    }

    /// Mark every file fully downloaded.
    pub fn complete_all(&self) {
        for file in lock(&self.files).iter() {
            file.set_completed(file.length);
        }
        let mut stats = lock(&self.stats);
        stats.bytes_completed = stats.bytes_total;
    }

    /// Replace the reported upload ratio.
    pub fn set_ratio(&self, ratio: f64) {
        lock(&self.stats).ratio = ratio;
    }

    /// File handle by index.
    #[must_use]
    pub fn file(&self, index: usize) -> Option<Arc<ScriptedFile>> {
        lock(&self.files).get(index).cloned()
    }

    /// Trackers currently announced to, including injected ones.
    #[must_use]
    pub fn trackers(&self) -> Vec<String> {
        lock(&self.announce)
            .iter()
            .filter(|url| !url.is_empty())
            .cloned()
            .collect()
    }

    /// Whether uploading is currently permitted.
    #[must_use]
    pub fn upload_allowed(&self) -> bool {
        self.upload_allowed.load(Ordering::SeqCst)
    }

    /// Whether downloading is currently permitted.
    #[must_use]
    pub fn download_allowed(&self) -> bool {
        self.download_allowed.load(Ordering::SeqCst)
    }

    /// Block the next metainfo read until the returned sender fires or is
    /// dropped. The read blocks its thread, so use a multi-thread runtime.
    #[must_use]
    pub fn hold_metainfo(&self) -> Sender<()> {
        let (release, gate) = mpsc::channel();
        *lock(&self.metainfo_gate) = Some(gate);
        release
    }

    /// How many metainfo reads have started.
    #[must_use]
    pub fn metainfo_reads(&self) -> usize {
        self.metainfo_reads.load(Ordering::SeqCst)
    }

    /// How many times the engine waited on the metadata signal.
    #[must_use]
    pub fn metadata_waits(&self) -> usize {
        self.metadata_waits.load(Ordering::SeqCst)
    }

    /// How many times the engine released the task.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolTask for ScriptedTask {
    async fn metadata_ready(&self) {
        self.metadata_waits.fetch_add(1, Ordering::SeqCst);
        let mut receiver = self.metadata.subscribe();
        // The sender lives in `self`, so the wait can only end with `true`.
        let _ = receiver.wait_for(|ready| *ready).await;
    }

    fn has_metadata(&self) -> bool {
        *self.metadata.borrow()
    }

    fn name(&self) -> String {
        lock(&self.name).clone()
    }

    fn metainfo(&self) -> Option<Vec<u8>> {
        self.metainfo_reads.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.metainfo_gate).take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        lock(&self.metainfo).clone()
    }

    fn files(&self) -> Vec<Arc<dyn ProtocolFile>> {
        lock(&self.files)
            .iter()
            .map(|file| Arc::clone(file) as Arc<dyn ProtocolFile>)
            .collect()
    }

    fn announce_count(&self) -> usize {
        lock(&self.announce).len()
    }

    fn add_trackers(&self, trackers: &[String]) -> Result<()> {
        lock(&self.announce).extend(trackers.iter().cloned());
        Ok(())
    }

    fn allow_upload(&self) {
        self.upload_allowed.store(true, Ordering::SeqCst);
    }

    fn disallow_upload(&self) {
        self.upload_allowed.store(false, Ordering::SeqCst);
    }

    fn allow_download(&self) {
        self.download_allowed.store(true, Ordering::SeqCst);
    }

    fn disallow_download(&self) {
        self.download_allowed.store(false, Ordering::SeqCst);
    }

    fn stats(&self) -> TaskStats {
        *lock(&self.stats)
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// File handle with a settable completion counter.
pub struct ScriptedFile {
    path: String,
    length: u64,
    completed: AtomicU64,
    priority: Mutex<PiecePriority>,
}

impl ScriptedFile {
    fn new(path: &str, length: u64) -> Self {
        Self {
            path: path.to_string(),
            length,
            completed: AtomicU64::new(0),
            priority: Mutex::new(PiecePriority::None),
        }
    }

    /// Set the verified byte count.
    pub fn set_completed(&self, bytes: u64) {
        self.completed.store(bytes.min(self.length), Ordering::SeqCst);
    }

    /// Priority last applied by the engine.
    #[must_use]
    pub fn priority(&self) -> PiecePriority {
        *lock(&self.priority)
    }
}

impl ProtocolFile for ScriptedFile {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn bytes_completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    fn set_priority(&self, priority: PiecePriority) {
        *lock(&self.priority) = priority;
    }
}
