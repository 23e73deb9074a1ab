//! Run progress reporting.
//!
//! The engine reports each batch through a [`RunTracker`]. [`EventEmitter`]
//! fans those [`RunEvent`]s out over a [`tokio::sync::broadcast`] channel so
//! job runners, loggers or UIs can follow a run without touching the engine.

use serde::{Deserialize, Serialize};

use enrich_types::BatchStats;

/// Events emitted while a batch runs. `run_id` ties the events of one batch together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    BatchStarted {
        run_id: String,
        pipeline_id: String,
        entity_count: usize,
    },
    EntityProcessed {
        run_id: String,
        entity_id: String,
        processed: usize,
        total: usize,
    },
    EntitySkipped {
        run_id: String,
        entity_id: String,
        reason: String,
    },
    BatchFailed {
        run_id: String,
        entity_id: String,
        error: String,
    },
    BatchCompleted {
        run_id: String,
        stats: BatchStats,
        duration_ms: u64,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::BatchStarted { run_id, .. }
            | RunEvent::EntityProcessed { run_id, .. }
            | RunEvent::EntitySkipped { run_id, .. }
            | RunEvent::BatchFailed { run_id, .. }
            | RunEvent::BatchCompleted { run_id, .. } => run_id,
        }
    }
}

/// Receives progress from the engine. Must not block.
pub trait RunTracker: Send + Sync {
    fn report(&self, event: RunEvent);
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Events with no subscriber are dropped.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl RunTracker for EventEmitter {
    fn report(&self, event: RunEvent) {
        self.emit(event);
    }
}
