//! Event loop driving one admitted task.
//!
//! The loop first waits for metadata, then ticks at a fixed interval until the
//! task is dropped or the engine shuts down. Shutdown takes precedence over
//! drop, and drop over metadata, whenever several are ready at once.

use std::sync::Arc;

use chrono::Utc;
use kestrel_events::{DiscoveredFile, Event};
use kestrel_torrent_core::{ProtocolTask, TaskId};
use tokio::process::Command;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::{Engine, Runtime};
use crate::policy;
use crate::task::TaskSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Shutdown,
    Dropped,
}

pub(crate) struct TaskWorker {
    engine: Arc<Engine>,
    slot: Arc<TaskSlot>,
    handle: Arc<dyn ProtocolTask>,
    id: TaskId,
    runtime: Runtime,
}

impl TaskWorker {
    pub(crate) fn new(
        engine: Arc<Engine>,
        id: TaskId,
        slot: Arc<TaskSlot>,
        handle: Arc<dyn ProtocolTask>,
        runtime: Runtime,
    ) -> Self {
        Self {
            engine,
            slot,
            handle,
            id,
            runtime,
        }
    }

    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let exit = self.drive().await;
        self.handle.release();
        match exit {
            Exit::Shutdown => info!(task_id = %self.id, "engine shut down, task worker exiting"),
            Exit::Dropped => {
                info!(task_id = %self.id, "task dropped, task worker exiting");
                self.engine.spawn_admit_next();
            }
        }
    }

    async fn drive(&self) -> Exit {
        let shutdown = &self.runtime.shutdown;
        let dropped = &self.slot.drop_signal;

        if !self.handle.has_metadata() {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Exit::Shutdown,
                () = dropped.cancelled() => return Exit::Dropped,
                () = self.handle.metadata_ready() => {}
            }
        }
        // A drop racing the metadata signal still wins.
        if let Some(exit) = self.interrupted() {
            return exit;
        }

        self.on_metadata().await;
        if self.runtime.config.auto_start {
            self.engine.spawn_start(self.id.clone());
        }

        let period = self.engine.timings().tick_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Exit::Shutdown,
                () = dropped.cancelled() => return Exit::Dropped,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    fn interrupted(&self) -> Option<Exit> {
        if self.runtime.shutdown.is_cancelled() {
            Some(Exit::Shutdown)
        } else if self.slot.drop_signal.is_cancelled() {
            Some(Exit::Dropped)
        } else {
            None
        }
    }

    async fn on_metadata(&self) {
        let (files, state) = {
            let mut task = self.slot.task.lock().await;
            task.attach_metadata();
            let snapshot = task.snapshot();
            (snapshot.files, snapshot.state)
        };
        info!(task_id = %self.id, files = files.len(), "task metadata received");

        if let Some(bytes) = self.handle.metainfo() {
            // Deletion marks the task under this lock before purging the record.
            let task = self.slot.task.lock().await;
            if task.is_deleted() {
                debug!(task_id = %self.id, "task deleted, resume record not promoted");
            } else if let Err(err) = self.runtime.cache.store_complete(&self.id, &bytes) {
                warn!(task_id = %self.id, error = %err, "failed to promote resume record");
            }
        }

        self.engine.publish(Event::FilesDiscovered {
            task_id: self.id.to_string(),
            files: files
                .into_iter()
                .map(|file| DiscoveredFile {
                    path: file.path,
                    size_bytes: file.size,
                })
                .collect(),
        });
        self.engine.publish(Event::StateChanged {
            task_id: self.id.to_string(),
            state,
        });
        self.engine.notify_change();
    }

    async fn tick(&self) {
        let (completion, action, state) = {
            let mut task = self.slot.task.lock().await;
            task.refresh_files();
            task.refresh_stats();
            let completion = task.take_completion(&self.runtime.config.download_directory);
            let action = policy::evaluate(&task.standing(), &self.runtime.config, Utc::now());
            (completion, action, task.state())
        };

        if let Some(notice) = completion {
            info!(task_id = %self.id, size = notice.size, "task completed");
            self.engine.publish(Event::Completed {
                task_id: self.id.to_string(),
                path: notice.path.display().to_string(),
            });
            self.engine.publish(Event::StateChanged {
                task_id: self.id.to_string(),
                state,
            });
            self.engine.notify_change();
            self.engine.spawn_completion(notice);
        }

        if let Some(action) = action {
            debug!(task_id = %self.id, action = action.as_str(), "governance policy triggered");
            self.engine.spawn_policy(self.id.clone(), action);
        }
    }
}

/// Run a post-processing command through the shell without waiting on it.
pub(crate) fn spawn_post_command(task_id: TaskId, command: String) {
    tokio::spawn(async move {
        match Command::new("sh").arg("-c").arg(&command).status().await {
            Ok(status) if status.success() => {
                info!(task_id = %task_id, command = %command, "post-processing command finished");
            }
            Ok(status) => {
                warn!(
                    task_id = %task_id,
                    command = %command,
                    code = ?status.code(),
                    "post-processing command failed"
                );
            }
            Err(err) => {
                warn!(
                    task_id = %task_id,
                    command = %command,
                    error = %err,
                    "post-processing command could not be started"
                );
            }
        }
    });
}
