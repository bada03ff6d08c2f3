//! Core event primitives for the Kestrel download engine.
//!
//! Two notification paths live here. The [`EventBus`] carries typed domain
//! events with sequential identifiers and a bounded replay buffer so that late
//! subscribers can catch up. The [`ChangeSignal`] is a single-slot,
//! level-triggered wake-up for observers that only need to know "something
//! changed, re-read the task table".

mod change;

pub use change::ChangeSignal;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};

/// Identifier assigned to each event emitted by the engine.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Typed domain events surfaced by the engine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskAdded {
        task_id: String,
        name: String,
    },
    TaskQueued {
        task_id: String,
        position: usize,
    },
    FilesDiscovered {
        task_id: String,
        files: Vec<DiscoveredFile>,
    },
    StateChanged {
        task_id: String,
        state: TaskState,
    },
    Completed {
        task_id: String,
        path: String,
    },
    PolicyApplied {
        task_id: String,
        action: String,
    },
    TaskRemoved {
        task_id: String,
    },
    EngineReconfigured {
        incoming_port: u16,
    },
}

impl Event {
    /// Machine-friendly discriminator for log and metric labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TaskAdded { .. } => "task_added",
            Self::TaskQueued { .. } => "task_queued",
            Self::FilesDiscovered { .. } => "files_discovered",
            Self::StateChanged { .. } => "state_changed",
            Self::Completed { .. } => "completed",
            Self::PolicyApplied { .. } => "policy_applied",
            Self::TaskRemoved { .. } => "task_removed",
            Self::EngineReconfigured { .. } => "engine_reconfigured",
        }
    }

    /// Task identity carried by the event, when it concerns a single task.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskAdded { task_id, .. }
            | Self::TaskQueued { task_id, .. }
            | Self::FilesDiscovered { task_id, .. }
            | Self::StateChanged { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::PolicyApplied { task_id, .. }
            | Self::TaskRemoved { task_id } => Some(task_id),
            Self::EngineReconfigured { .. } => None,
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

/// Individual file reported by the protocol engine once metadata is known.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: String,
    pub size_bytes: u64,
}

/// Lifecycle states of a download task.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for an admission slot; no protocol handle exists yet.
    Queued,
    /// Handed to the protocol engine, metadata not yet known.
    Pending,
    Started,
    Stopped,
    /// Every byte has been transferred.
    Done,
    /// Terminal.
    Deleted,
}

impl TaskState {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Done => "done",
            Self::Deleted => "deleted",
        }
    }
}

/// Ring of recently published envelopes plus the next identifier to hand out.
///
/// Both live under one lock so replay order always matches id order.
#[derive(Debug)]
struct Replay {
    next_id: EventId,
    capacity: usize,
    recent: VecDeque<EventEnvelope>,
}

impl Replay {
    fn push(&mut self, event: Event) -> EventEnvelope {
        let envelope = EventEnvelope {
            id: self.next_id,
            timestamp: Utc::now(),
            event,
        };
        self.next_id += 1;
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(envelope.clone());
        envelope
    }

    fn after(&self, since: EventId) -> VecDeque<EventEnvelope> {
        self.recent
            .iter()
            .filter(|envelope| envelope.id > since)
            .cloned()
            .collect()
    }
}

/// Cloneable handle publishing [`Event`]s to every live [`EventStream`].
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    replay: Arc<Mutex<Replay>>,
}

impl EventBus {
    /// Bus whose broadcast channel and replay ring both hold `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(Replay {
                next_id: 1,
                capacity,
                recent: VecDeque::with_capacity(capacity),
            })),
        }
    }

    /// Bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish `event`, returning the identifier it was assigned.
    ///
    /// # Panics
    ///
    /// Panics if the replay mutex has been poisoned.
    pub fn publish(&self, event: Event) -> EventId {
        let mut replay = self.replay.lock().expect("event replay mutex poisoned");
        let envelope = replay.push(event);
        let id = envelope.id;
        // Sending under the lock keeps live delivery in id order.
        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to live events. With `since_id`, buffered events newer than
    /// that id are delivered first.
    ///
    /// # Panics
    ///
    /// Panics if the replay mutex has been poisoned.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let replay = self.replay.lock().expect("event replay mutex poisoned");
        // Subscribing under the lock means no event is both replayed and received live.
        EventStream {
            backlog: since_id.map(|since| replay.after(since)).unwrap_or_default(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Identifier of the most recent event still held for replay.
    ///
    /// # Panics
    ///
    /// Panics if the replay mutex has been poisoned.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let replay = self.replay.lock().expect("event replay mutex poisoned");
        replay.recent.back().map(|envelope| envelope.id)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side of an [`EventBus`]: replayed events first, then live ones.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Next event, or `None` once every bus handle is gone. Events that fell
    /// out of the channel while the subscriber lagged are skipped.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Some(envelope);
        }
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
