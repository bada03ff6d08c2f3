#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kestrel_config::EngineConfig;
use kestrel_engine::{Engine, EngineTimings, TaskSnapshot};
use kestrel_events::{Event, EventStream};
use kestrel_telemetry::Metrics;
use kestrel_test_support::{
    FixtureParser, RecordingHook, ScriptedEngine, ScriptedFactory, ScriptedTask, wait_until,
};
use kestrel_torrent_core::TaskId;
use tempfile::TempDir;

pub const PATIENCE: Duration = Duration::from_secs(3);

pub fn fast_timings() -> EngineTimings {
    EngineTimings {
        tick_interval: Duration::from_millis(10),
        settle_delay: Duration::from_millis(5),
        rebuild_attempts: 3,
        rebuild_backoff: Duration::from_millis(5),
    }
}

pub fn config(root: &Path) -> EngineConfig {
    EngineConfig {
        incoming_port: 6_881,
        download_directory: root.to_path_buf(),
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub factory: Arc<ScriptedFactory>,
    pub metrics: Metrics,
    pub hook: Arc<RecordingHook>,
    pub root: TempDir,
}

impl Harness {
    pub async fn start(adjust: impl FnOnce(&mut EngineConfig)) -> Result<Self> {
        Self::with_hook(RecordingHook::new(), adjust).await
    }

    pub async fn with_hook(
        hook: RecordingHook,
        adjust: impl FnOnce(&mut EngineConfig),
    ) -> Result<Self> {
        let root = TempDir::new()?;
        let factory = ScriptedFactory::new();
        let metrics = Metrics::new()?;
        let hook = Arc::new(hook);
        let engine = Arc::new(
            Engine::new(factory.clone(), Arc::new(FixtureParser))
                .with_hook(hook.clone())
                .with_metrics(metrics.clone())
                .with_timings(fast_timings()),
        );
        let mut cfg = config(root.path());
        adjust(&mut cfg);
        engine.configure(cfg).await?;
        Ok(Self {
            engine,
            factory,
            metrics,
            hook,
            root,
        })
    }

    pub fn protocol(&self) -> Result<Arc<ScriptedEngine>> {
        self.factory.latest().context("protocol engine constructed")
    }

    pub fn scripted(&self, id: &TaskId) -> Result<Arc<ScriptedTask>> {
        self.protocol()?
            .task(id)
            .with_context(|| format!("task {id} handed to the protocol engine"))
    }

    pub async fn snapshot(&self, id: &TaskId) -> Result<TaskSnapshot> {
        Ok(self.engine.task(id).await?)
    }

    pub async fn wait_for_task(
        &self,
        what: &str,
        id: &TaskId,
        check: impl Fn(&TaskSnapshot) -> bool,
    ) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let id = id.clone();
        let check = &check;
        wait_until(what, PATIENCE, move || {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            async move { engine.task(&id).await.is_ok_and(|snapshot| check(&snapshot)) }
        })
        .await
    }
}

/// Collect events until the stream stays quiet for a short while.
pub async fn drain(stream: &mut EventStream) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(Some(envelope)) =
        tokio::time::timeout(Duration::from_millis(50), stream.next()).await
    {
        events.push(envelope.event);
    }
    events
}
