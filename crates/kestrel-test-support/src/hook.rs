//! Completion hook that records notices and replies with canned commands.

use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use kestrel_torrent_core::{CompletedTask, CompletionHook};

/// Records every completion notice it receives.
#[derive(Default)]
pub struct RecordingHook {
    commands: Vec<String>,
    fail: bool,
    completed: Mutex<Vec<CompletedTask>>,
}

impl RecordingHook {
    /// Hook replying with no commands.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook replying with `commands` on every completion.
    #[must_use]
    pub fn with_commands(commands: &[&str]) -> Self {
        Self {
            commands: commands.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    /// Hook that records the notice and then reports an error.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Notices received so far.
    #[must_use]
    pub fn completed(&self) -> Vec<CompletedTask> {
        self.completed
            .lock()
            .expect("recording hook mutex poisoned")
            .clone()
    }
}

#[async_trait]
impl CompletionHook for RecordingHook {
    async fn on_task_done(&self, task: &CompletedTask) -> Result<Vec<String>> {
        self.completed
            .lock()
            .expect("recording hook mutex poisoned")
            .push(task.clone());
        if self.fail {
            bail!("controller rejected completion of {}", task.task_id);
        }
        Ok(self.commands.clone())
    }
}
