//! Top-level orchestrator owning the task table, the wait list and the
//! protocol engine handle.
//!
//! # Design
//! - Lock order is engine state, wait list, task table, then a single task.
//!   Submission and admission hold a read guard on the engine state for their
//!   whole run, so reconfiguration waits for them and they never act on a
//!   retired [`Runtime`]. Reconfiguration never takes a task lock.
//! - Holding the wait list lock serialises admission decisions.
//! - Work that may re-enter the engine (policy actions, cascaded stops,
//!   auto-start, post-drop admission) runs on detached tasks.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use kestrel_config::EngineConfig;
use kestrel_events::{ChangeSignal, Event, EventBus, TaskState};
use kestrel_telemetry::Metrics;
use kestrel_torrent_core::{
    CompletedTask, CompletionHook, DescriptorParser, ProtocolEngine, ProtocolFactory,
    ProtocolSettings, TaskId, TaskSource, TaskSpec, TorrentError,
};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{WaitEntry, WaitList};
use crate::cache::ResumeCache;
use crate::error::{EngineError, EngineResult};
use crate::plan;
use crate::policy::PolicyAction;
use crate::task::{Task, TaskSlot, TaskSnapshot};
use crate::worker::{self, TaskWorker};

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_REBUILD_ATTEMPTS: u32 = 10;
const DEFAULT_REBUILD_BACKOFF: Duration = Duration::from_secs(3);

/// Timing knobs for the worker loop and protocol engine rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimings {
    /// Interval between worker refresh ticks.
    pub tick_interval: Duration,
    /// Pause after closing the previous protocol engine.
    pub settle_delay: Duration,
    /// Construction attempts before reconfiguration fails.
    pub rebuild_attempts: u32,
    /// Pause between construction attempts.
    pub rebuild_backoff: Duration,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            rebuild_attempts: DEFAULT_REBUILD_ATTEMPTS,
            rebuild_backoff: DEFAULT_REBUILD_BACKOFF,
        }
    }
}

/// Snapshot of everything a configured engine hands to its workers.
#[derive(Clone)]
pub(crate) struct Runtime {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) protocol: Arc<dyn ProtocolEngine>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) cache: ResumeCache,
}

#[derive(Default)]
struct EngineState {
    config: Option<Arc<EngineConfig>>,
    runtime: Option<Runtime>,
}

/// Download task lifecycle engine.
///
/// Share it behind an [`Arc`]; operations that spawn background work take
/// `self: &Arc<Self>`.
pub struct Engine {
    factory: Arc<dyn ProtocolFactory>,
    parser: Arc<dyn DescriptorParser>,
    hook: Option<Arc<dyn CompletionHook>>,
    metrics: Option<Metrics>,
    events: EventBus,
    changes: ChangeSignal,
    timings: EngineTimings,
    state: RwLock<EngineState>,
    wait_list: Mutex<WaitList>,
    tasks: RwLock<HashMap<TaskId, Arc<TaskSlot>>>,
}

impl Engine {
    /// Unconfigured engine using the given protocol factory and descriptor parser.
    #[must_use]
    pub fn new(factory: Arc<dyn ProtocolFactory>, parser: Arc<dyn DescriptorParser>) -> Self {
        Self {
            factory,
            parser,
            hook: None,
            metrics: None,
            events: EventBus::new(),
            changes: ChangeSignal::new(),
            timings: EngineTimings::default(),
            state: RwLock::new(EngineState::default()),
            wait_list: Mutex::new(WaitList::default()),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Notify `hook` whenever a task finishes transferring.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Report gauges and counters through `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish domain events on an existing bus.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Override the default tick, settle and rebuild timings.
    #[must_use]
    pub const fn with_timings(mut self, timings: EngineTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Event bus carrying task lifecycle events.
    #[must_use]
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Single-slot "something changed" signal.
    #[must_use]
    pub fn changes(&self) -> ChangeSignal {
        self.changes.clone()
    }

    /// Whether a protocol engine is currently running.
    pub async fn is_configured(&self) -> bool {
        self.state.read().await.runtime.is_some()
    }

    /// Last configuration committed by [`Self::configure`].
    pub async fn config(&self) -> Option<EngineConfig> {
        self.state
            .read()
            .await
            .config
            .as_deref()
            .cloned()
    }

    /// Apply a configuration, replacing any running protocol engine.
    ///
    /// Every active task is dropped and the table is cleared; resume records
    /// stay on disk and can be re-submitted with [`Self::restore_cached`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for rejected configurations,
    /// [`EngineError::EngineConstructionFailed`] once every rebuild attempt
    /// failed, and [`EngineError::Io`] when the cache directory cannot be
    /// created.
    pub async fn configure(&self, config: EngineConfig) -> EngineResult<()> {
        config.validate()?;
        let settings = plan::protocol_settings(&config)?;

        let mut state = self.state.write().await;
        if let Some(previous) = state.runtime.take() {
            self.teardown(previous, true).await;
            info!("previous protocol engine closed");
            tokio::time::sleep(self.timings.settle_delay).await;
        }

        let protocol = self.construct(&settings).await?;
        let cache = ResumeCache::new(config.cache_dir());
        if let Err(err) = cache.ensure_dir() {
            protocol.close().await;
            return Err(err);
        }
        self.wait_list
            .lock()
            .await
            .set_limit(config.concurrency_limit());

        let config = Arc::new(config);
        state.runtime = Some(Runtime {
            config: Arc::clone(&config),
            protocol,
            shutdown: CancellationToken::new(),
            cache,
        });
        state.config = Some(config);
        drop(state);

        if let Some(metrics) = &self.metrics {
            metrics.inc_reconfiguration();
        }
        self.publish(Event::EngineReconfigured {
            incoming_port: settings.incoming_port,
        });
        info!(
            incoming_port = settings.incoming_port,
            download_root = %settings.download_root.display(),
            "protocol engine configured"
        );
        Ok(())
    }

    /// Stop every worker and close the protocol engine, keeping resume records.
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        if let Some(runtime) = state.runtime.take() {
            self.teardown(runtime, false).await;
            info!("engine shut down");
        }
    }

    /// Submit a magnet URI.
    ///
    /// # Errors
    ///
    /// See [`Self::add`].
    pub async fn add_magnet(self: &Arc<Self>, uri: &str) -> EngineResult<TaskId> {
        self.add(TaskSource::magnet(uri)).await
    }

    /// Submit raw manifest bytes.
    ///
    /// # Errors
    ///
    /// See [`Self::add`].
    pub async fn add_manifest(self: &Arc<Self>, bytes: &[u8]) -> EngineResult<TaskId> {
        self.add(TaskSource::manifest(bytes)).await
    }

    /// Parse a descriptor, persist its resume record and admit or queue it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MaxConcurrentReached`] when the task was queued
    /// rather than admitted, [`EngineError::AlreadyExists`] for tracked
    /// identities, [`EngineError::MalformedDescriptor`] when parsing fails or
    /// panics, and [`EngineError::Protocol`] when the protocol engine refuses
    /// the task.
    pub async fn add(self: &Arc<Self>, source: TaskSource) -> EngineResult<TaskId> {
        let state = self.state.read().await;
        let runtime = state.runtime.as_ref().ok_or(EngineError::NotConfigured)?;
        self.submit(runtime, source).await
    }

    /// Re-submit every resume record found under the download root.
    ///
    /// Returns how many records were admitted or queued.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotConfigured`] before the first configuration
    /// and [`EngineError::Io`] when the cache directory cannot be read.
    pub async fn restore_cached(self: &Arc<Self>) -> EngineResult<usize> {
        let state = self.state.read().await;
        let runtime = state.runtime.as_ref().ok_or(EngineError::NotConfigured)?;
        let records = runtime.cache.load_all()?;
        let mut restored = 0;
        for record in records {
            let id = record.id().clone();
            match self.submit(runtime, record.into_source()).await {
                Ok(_) | Err(EngineError::MaxConcurrentReached { .. }) => restored += 1,
                Err(err) => {
                    warn!(task_id = %id, error = %err, "cached task could not be restored");
                }
            }
        }
        info!(restored, "resume records re-submitted");
        Ok(restored)
    }

    /// Admit the oldest queued task if a slot is free.
    ///
    /// Returns the admitted identity, or `None` when no slot is free.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WaitListEmpty`] when nothing is queued and
    /// [`EngineError::NotConfigured`] before the first configuration.
    pub async fn admit_next(self: &Arc<Self>) -> EngineResult<Option<TaskId>> {
        let state = self.state.read().await;
        let runtime = state.runtime.as_ref().ok_or(EngineError::NotConfigured)?;
        let mut wait = self.wait_list.lock().await;
        loop {
            let active = self.tasks.read().await.len().saturating_sub(wait.len());
            if !wait.is_ready(active) {
                return Ok(None);
            }
            let WaitEntry { id, kind } = wait.dequeue_next()?;
            let Some(slot) = self.tasks.read().await.get(&id).cloned() else {
                continue;
            };
            if !slot.task.lock().await.is_queued() {
                continue;
            }

            let spec = match runtime.cache.load(&id) {
                Ok(Some(record)) => self.parse(&record.into_source()),
                Ok(None) => Err(EngineError::TaskNotFound {
                    task_id: id.clone(),
                }),
                Err(err) => Err(err),
            };
            let outcome = match spec {
                Ok(spec) => self.launch(runtime, &spec, slot).await,
                Err(err) => {
                    self.tasks.write().await.remove(&id);
                    Err(err)
                }
            };
            let table_len = self.tasks.read().await.len();
            self.record_gauges(table_len, wait.len());

            match outcome {
                Ok(()) => return Ok(Some(id)),
                Err(err) => {
                    warn!(
                        task_id = %id,
                        kind = kind.as_str(),
                        error = %err,
                        "queued task could not be admitted"
                    );
                    self.publish(Event::TaskRemoved {
                        task_id: id.to_string(),
                    });
                }
            }
        }
    }

    /// Start a task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] or [`EngineError::AlreadyStarted`].
    pub async fn start_task(&self, id: &TaskId) -> EngineResult<()> {
        let slot = self.slot(id).await?;
        let state = {
            let mut task = slot.task.lock().await;
            task.start()?;
            task.state()
        };
        info!(task_id = %id, "task started");
        self.task_changed(id, state);
        Ok(())
    }

    /// Start a task on explicit user request, exempting it from auto-stop.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] or [`EngineError::AlreadyStarted`].
    pub async fn manual_start_task(&self, id: &TaskId) -> EngineResult<()> {
        let slot = self.slot(id).await?;
        let state = {
            let mut task = slot.task.lock().await;
            task.manual_start()?;
            task.state()
        };
        info!(task_id = %id, "task started manually");
        self.task_changed(id, state);
        Ok(())
    }

    /// Stop a task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] or [`EngineError::AlreadyStopped`].
    pub async fn stop_task(&self, id: &TaskId) -> EngineResult<()> {
        let slot = self.slot(id).await?;
        let state = {
            let mut task = slot.task.lock().await;
            task.stop()?;
            task.state()
        };
        info!(task_id = %id, "task stopped");
        self.task_changed(id, state);
        Ok(())
    }

    /// Delete a task in any state, purging its resume record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] when the identity is not tracked.
    pub async fn delete_task(&self, id: &TaskId) -> EngineResult<()> {
        let cache = self
            .state
            .read()
            .await
            .runtime
            .as_ref()
            .map(|runtime| runtime.cache.clone());

        let mut wait = self.wait_list.lock().await;
        let removed = self.tasks.write().await.remove(id);
        let was_queued = wait.remove(id);
        let Some(slot) = removed else {
            return Err(EngineError::TaskNotFound {
                task_id: id.clone(),
            });
        };
        slot.drop_signal.cancel();
        let table_len = self.tasks.read().await.len();
        self.record_gauges(table_len, wait.len());
        drop(wait);
        slot.task.lock().await.mark_deleted();

        if let Some(cache) = cache
            && let Err(err) = cache.remove(id)
        {
            warn!(task_id = %id, error = %err, "failed to purge resume record");
        }
        info!(task_id = %id, queued = was_queued, "task deleted");
        self.publish(Event::StateChanged {
            task_id: id.to_string(),
            state: TaskState::Deleted,
        });
        self.publish(Event::TaskRemoved {
            task_id: id.to_string(),
        });
        self.notify_change();
        Ok(())
    }

    /// Select a single file for transfer. The task's own state is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`], [`EngineError::MissingFile`] or
    /// [`EngineError::AlreadyStarted`].
    pub async fn start_file(&self, id: &TaskId, path: &str) -> EngineResult<()> {
        let slot = self.slot(id).await?;
        slot.task.lock().await.start_file(path)?;
        debug!(task_id = %id, path, "file started");
        self.notify_change();
        Ok(())
    }

    /// Deselect a single file; stopping the last started file stops the task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`], [`EngineError::MissingFile`] or
    /// [`EngineError::AlreadyStopped`].
    pub async fn stop_file(self: &Arc<Self>, id: &TaskId, path: &str) -> EngineResult<()> {
        let slot = self.slot(id).await?;
        let last = slot.task.lock().await.stop_file(path)?;
        debug!(task_id = %id, path, "file stopped");
        if last {
            self.spawn_stop(id.clone());
        }
        self.notify_change();
        Ok(())
    }

    /// Snapshot of a single task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] when the identity is not tracked.
    pub async fn task(&self, id: &TaskId) -> EngineResult<TaskSnapshot> {
        let slot = self.slot(id).await?;
        let snapshot = slot.task.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Snapshots of every tracked task, ordered by identity.
    pub async fn tasks(&self) -> Vec<TaskSnapshot> {
        let slots: Vec<Arc<TaskSlot>> = self.tasks.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            snapshots.push(slot.task.lock().await.snapshot());
        }
        snapshots.sort_by(|left, right| left.id.cmp(&right.id));
        snapshots
    }

    /// Queued identities in admission order.
    pub async fn queued(&self) -> Vec<TaskId> {
        self.wait_list.lock().await.ids()
    }

    /// Drop token of a tracked task; it fires when the task is deleted or
    /// the engine is reconfigured.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] when the identity is not tracked.
    pub async fn drop_signal(&self, id: &TaskId) -> EngineResult<CancellationToken> {
        Ok(self.slot(id).await?.drop_signal.clone())
    }

    pub(crate) const fn timings(&self) -> &EngineTimings {
        &self.timings
    }

    pub(crate) fn publish(&self, event: Event) {
        self.events.publish(event);
    }

    pub(crate) fn notify_change(&self) {
        if !self.changes.notify() {
            debug!("change notification coalesced");
        }
    }

    pub(crate) fn spawn_start(self: &Arc<Self>, id: TaskId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.start_task(&id).await {
                Ok(()) | Err(EngineError::AlreadyStarted { .. } | EngineError::TaskNotFound { .. }) => {}
                Err(err) => warn!(task_id = %id, error = %err, "auto-start failed"),
            }
        });
    }

    fn spawn_stop(self: &Arc<Self>, id: TaskId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.stop_task(&id).await {
                Ok(()) | Err(EngineError::AlreadyStopped { .. } | EngineError::TaskNotFound { .. }) => {}
                Err(err) => warn!(task_id = %id, error = %err, "cascaded stop failed"),
            }
        });
    }

    pub(crate) fn spawn_policy(self: &Arc<Self>, id: TaskId, action: PolicyAction) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match action {
                PolicyAction::Stop => engine.stop_task(&id).await,
                PolicyAction::Delete => engine.delete_task(&id).await,
            };
            match outcome {
                Ok(()) => {
                    info!(task_id = %id, action = action.as_str(), "governance policy applied");
                    if let Some(metrics) = &engine.metrics {
                        metrics.inc_policy_action(action.as_str());
                    }
                    engine.publish(Event::PolicyApplied {
                        task_id: id.to_string(),
                        action: action.as_str().to_string(),
                    });
                }
                Err(EngineError::AlreadyStopped { .. } | EngineError::TaskNotFound { .. }) => {}
                Err(err) => {
                    warn!(task_id = %id, action = action.as_str(), error = %err, "governance policy failed");
                }
            }
        });
    }

    pub(crate) fn spawn_admit_next(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.admit_next().await {
                Ok(Some(id)) => info!(task_id = %id, "queued task admitted"),
                Ok(None) | Err(EngineError::WaitListEmpty | EngineError::NotConfigured) => {}
                Err(err) => warn!(error = %err, "queued task admission failed"),
            }
        });
    }

    pub(crate) fn spawn_completion(&self, notice: CompletedTask) {
        let Some(hook) = self.hook.clone() else {
            return;
        };
        tokio::spawn(async move {
            match hook.on_task_done(&notice).await {
                Ok(commands) => {
                    for command in commands {
                        worker::spawn_post_command(notice.task_id.clone(), command);
                    }
                }
                Err(err) => {
                    warn!(task_id = %notice.task_id, error = %err, "completion hook failed");
                }
            }
        });
    }

    async fn slot(&self, id: &TaskId) -> EngineResult<Arc<TaskSlot>> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound {
                task_id: id.clone(),
            })
    }

    async fn submit(self: &Arc<Self>, runtime: &Runtime, source: TaskSource) -> EngineResult<TaskId> {
        let spec = self.parse(&source)?;
        if self.tasks.read().await.contains_key(&spec.id) {
            return Err(EngineError::AlreadyExists { task_id: spec.id });
        }

        match &spec.source {
            TaskSource::Magnet { uri } => runtime.cache.store_minimal(&spec.id, uri)?,
            TaskSource::Manifest { bytes } => runtime.cache.store_complete(&spec.id, bytes)?,
        }
        self.admit(runtime, spec).await
    }

    fn parse(&self, source: &TaskSource) -> EngineResult<TaskSpec> {
        let kind = source.kind();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match source {
            TaskSource::Magnet { uri } => self.parser.parse_magnet(uri),
            TaskSource::Manifest { bytes } => self.parser.parse_manifest(bytes),
        }));
        match outcome {
            Ok(Ok(spec)) => Ok(spec),
            Ok(Err(err)) => Err(EngineError::MalformedDescriptor {
                kind,
                reason: format!("{err:#}"),
            }),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(kind = kind.as_str(), reason = %reason, "descriptor parser panicked");
                Err(EngineError::MalformedDescriptor { kind, reason })
            }
        }
    }

    async fn admit(self: &Arc<Self>, runtime: &Runtime, spec: TaskSpec) -> EngineResult<TaskId> {
        let id = spec.id.clone();
        let mut wait = self.wait_list.lock().await;
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&id) || wait.contains(&id) {
            return Err(EngineError::AlreadyExists { task_id: id });
        }

        let active = tasks.len().saturating_sub(wait.len());
        if !wait.is_ready(active) {
            let position = wait.enqueue(id.clone(), spec.kind())?;
            tasks.insert(id.clone(), TaskSlot::new(Task::queued(&spec)));
            let table_len = tasks.len();
            drop(tasks);
            self.record_gauges(table_len, wait.len());
            drop(wait);

            if let Some(metrics) = &self.metrics {
                metrics.inc_queued();
            }
            info!(task_id = %id, position, "concurrency limit reached, task queued");
            self.publish(Event::TaskQueued {
                task_id: id.to_string(),
                position,
            });
            self.notify_change();
            return Err(EngineError::MaxConcurrentReached {
                task_id: id,
                position,
            });
        }

        let slot = TaskSlot::new(Task::queued(&spec));
        tasks.insert(id.clone(), Arc::clone(&slot));
        drop(tasks);
        let outcome = self.launch(runtime, &spec, slot).await;
        let table_len = self.tasks.read().await.len();
        self.record_gauges(table_len, wait.len());
        drop(wait);
        outcome.map(|()| id)
    }

    /// Hand `spec` to the protocol engine and spawn its worker. The caller
    /// holds the wait list lock and has already placed `slot` in the table.
    async fn launch(
        self: &Arc<Self>,
        runtime: &Runtime,
        spec: &TaskSpec,
        slot: Arc<TaskSlot>,
    ) -> EngineResult<()> {
        let handle = match runtime.protocol.add_task(spec).await {
            Ok(handle) => handle,
            Err(err) => {
                let mut tasks = self.tasks.write().await;
                if tasks
                    .get(&spec.id)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot))
                {
                    tasks.remove(&spec.id);
                }
                return Err(TorrentError::operation_failed("add_task", Some(spec.id.clone()), err).into());
            }
        };

        let trackers = &runtime.config.trackers;
        if !trackers.is_empty()
            && (runtime.config.always_add_trackers || handle.announce_count() == 0)
        {
            match handle.add_trackers(trackers) {
                Ok(()) => debug!(task_id = %spec.id, count = trackers.len(), "public trackers added"),
                Err(err) => warn!(task_id = %spec.id, error = %err, "tracker injection failed"),
            }
        }

        let name = {
            let mut task = slot.task.lock().await;
            task.admit(spec, Arc::clone(&handle));
            task.snapshot().name
        };
        TaskWorker::new(
            Arc::clone(self),
            spec.id.clone(),
            slot,
            handle,
            runtime.clone(),
        )
        .spawn();

        if let Some(metrics) = &self.metrics {
            metrics.inc_admitted();
        }
        info!(task_id = %spec.id, kind = spec.kind().as_str(), "task admitted");
        self.publish(Event::TaskAdded {
            task_id: spec.id.to_string(),
            name,
        });
        self.publish(Event::StateChanged {
            task_id: spec.id.to_string(),
            state: TaskState::Pending,
        });
        self.notify_change();
        Ok(())
    }

    async fn construct(&self, settings: &ProtocolSettings) -> EngineResult<Arc<dyn ProtocolEngine>> {
        let attempts = self.timings.rebuild_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.factory.construct(settings).await {
                Ok(protocol) => {
                    debug!(attempt, "protocol engine constructed");
                    return Ok(protocol);
                }
                Err(err) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_rebuild_failure();
                    }
                    warn!(attempt, attempts, error = %err, "protocol engine construction failed");
                    if attempt >= attempts {
                        return Err(EngineError::EngineConstructionFailed {
                            attempts,
                            source: err.into(),
                        });
                    }
                    tokio::time::sleep(self.timings.rebuild_backoff).await;
                }
            }
        }
    }

    /// Tear down a running protocol engine. The caller holds the engine state
    /// write lock. Drop tokens fire only when `drop_tasks` is set, so a plain
    /// shutdown is distinguishable from a reconfiguration.
    async fn teardown(&self, runtime: Runtime, drop_tasks: bool) {
        let mut wait = self.wait_list.lock().await;
        let slots: Vec<Arc<TaskSlot>> = self
            .tasks
            .write()
            .await
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        wait.clear();
        drop(wait);

        if drop_tasks {
            for slot in &slots {
                slot.drop_signal.cancel();
            }
        }
        runtime.protocol.close().await;
        runtime.shutdown.cancel();
        self.record_gauges(0, 0);
        info!(tasks = slots.len(), "task table cleared");
        self.notify_change();
    }

    fn task_changed(&self, id: &TaskId, state: TaskState) {
        self.publish(Event::StateChanged {
            task_id: id.to_string(),
            state,
        });
        self.notify_change();
    }

    fn record_gauges(&self, table_len: usize, queued: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_active_tasks(table_len.saturating_sub(queued));
            metrics.set_queue_depth(queued);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "descriptor parser panicked".to_string())
}
