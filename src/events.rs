use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::QueueSnapshot;

/// Which backend produced a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Remote,
    Local,
}

/// Discrete events emitted by the orchestrator.
///
/// This stream is the sole observability surface. It carries no control
/// semantics: consumers are passive listeners, and a slow or absent
/// subscriber never affects segment processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// Segment admitted to the work queue.
    Queued { segment_id: Uuid },
    /// A remote attempt started (the segment now holds a concurrency slot).
    Started { segment_id: Uuid },
    /// A transcript was persisted; `engine` says which backend produced it.
    Completed { segment_id: Uuid, engine: EngineKind },
    /// A remote attempt failed; `failure_count` is the new total.
    AttemptFailed {
        segment_id: Uuid,
        failure_count: u32,
        error: String,
    },
    /// Segment parked because the network is unreachable.
    QueuedOffline { segment_id: Uuid },
    /// A delayed re-attempt was scheduled.
    RetryScheduled {
        segment_id: Uuid,
        attempt: u32,
        delay: Duration,
    },
    /// Remote budget exhausted; local fallback attempt started.
    FallbackStarted { segment_id: Uuid },
    /// The fallback failed too; the segment is terminally failed.
    FallbackFailed { segment_id: Uuid, error: String },
    /// Derived queue counts changed.
    SnapshotChanged(QueueSnapshot),
    /// The orchestrator stopped admitting work.
    Paused,
    /// The orchestrator started (or resumed) admitting work.
    Resumed,
}

/// Fan-out bus for orchestrator events.
///
/// Thin wrapper over a broadcast channel: any number of independent
/// subscribers, fire-and-forget sends.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the event stream. Each receiver sees every event sent
    /// after the subscription, subject to the channel capacity.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Never fails: with no subscribers the event is
    /// simply dropped.
    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
