//! Orchestrator core.
//!
//! A single coordinator task owns every piece of mutable state (running
//! flag, owned segments, admission queue, in-flight sets, derived counts)
//! and serializes all transitions through one command channel. Remote
//! attempts, fallback runs, and retry timers execute as spawned tasks that
//! report back over the same channel, so no two transitions for the same
//! segment can ever race.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{SegmentContext, TranscriptionBackend};
use crate::config::OrchestratorConfig;
use crate::events::{EngineKind, EventBus, OrchestratorEvent};
use crate::protocol::{QueueSnapshot, Segment, SegmentStatus};
use crate::reachability::NetworkPath;
use crate::retry::{JitterSource, RandomJitter, RetryDecision};
use crate::store::SegmentStore;
use crate::OrchestratorError;

/// Failure captured at the point of a remote attempt.
///
/// Audio-read errors and transport errors are deliberately unified here; the
/// retry path only ever inspects `retryable`.
#[derive(Debug, Clone)]
struct AttemptFailure {
    retryable: bool,
    message: String,
}

enum Command {
    Start,
    Stop,
    Enqueue(Segment),
    Snapshot(oneshot::Sender<QueueSnapshot>),
    ResetAndRetry {
        id: Uuid,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    NetworkChanged(NetworkPath),
    RetryDue(Uuid),
    AttemptDone {
        id: Uuid,
        outcome: Result<String, AttemptFailure>,
    },
    FallbackDone {
        id: Uuid,
        outcome: Result<String, String>,
    },
}

/// Handle to the orchestrator.
///
/// Cheap to clone; all methods forward commands to the coordinator task.
#[derive(Clone)]
pub struct Orchestrator {
    cmd_tx: mpsc::Sender<Command>,
    events: EventBus,
}

impl Orchestrator {
    /// Spawn an orchestrator with the default (random) retry jitter.
    pub fn new(
        store: Arc<dyn SegmentStore>,
        remote: Arc<dyn TranscriptionBackend>,
        fallback: Arc<dyn TranscriptionBackend>,
        reachability: watch::Receiver<NetworkPath>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_jitter(
            store,
            remote,
            fallback,
            reachability,
            config,
            Box::new(RandomJitter::new()),
        )
    }

    /// Spawn an orchestrator with an explicit jitter source (tests use a
    /// fixed one to make retry timing deterministic).
    pub fn with_jitter(
        store: Arc<dyn SegmentStore>,
        remote: Arc<dyn TranscriptionBackend>,
        fallback: Arc<dyn TranscriptionBackend>,
        mut reachability: watch::Receiver<NetworkPath>,
        config: OrchestratorConfig,
        jitter: Box<dyn JitterSource>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(128);

        let coordinator = Coordinator {
            store,
            remote,
            fallback,
            config,
            events: events.clone(),
            jitter,
            cmd_tx: cmd_tx.downgrade(),
            path: *reachability.borrow(),
            running: false,
            segments: HashMap::new(),
            waiting: VecDeque::new(),
            uploading: HashSet::new(),
            fallback_running: HashSet::new(),
            completed_total: 0,
            failed_total: 0,
            snapshot: QueueSnapshot::default(),
        };
        tokio::spawn(coordinator.run(cmd_rx));

        // Forward path changes into the command stream. The monitor never
        // touches segment state itself.
        let forward_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while reachability.changed().await.is_ok() {
                let path = *reachability.borrow_and_update();
                if forward_tx.send(Command::NetworkChanged(path)).await.is_err() {
                    break;
                }
            }
        });

        Self { cmd_tx, events }
    }

    /// Begin admitting work. Idempotent. Drains segments left `Pending` in
    /// the store (plus stale `Uploading` records from a crashed process).
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        self.send(Command::Start).await
    }

    /// Stop admitting new work. Idempotent. In-flight attempts and already
    /// scheduled retry timers are not cancelled; see module docs.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        self.send(Command::Stop).await
    }

    /// Admit a single segment. The segment must be `Pending`; while the
    /// orchestrator is stopped the call parks the record for the next
    /// `start()`, and while the network is unreachable the segment is marked
    /// `QueuedOffline` without any I/O.
    pub async fn enqueue(&self, segment: Segment) -> Result<(), OrchestratorError> {
        if segment.status != SegmentStatus::Pending {
            return Err(OrchestratorError::NotPending {
                id: segment.id,
                status: segment.status,
            });
        }
        self.send(Command::Enqueue(segment)).await
    }

    /// Current derived queue counts. No side effects.
    pub async fn queue_status(&self) -> Result<QueueSnapshot, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        rx.await.map_err(|_| OrchestratorError::Closed)
    }

    /// Operator reset: clear the failure counter and last error of a
    /// `Failed` segment and re-admit it.
    pub async fn retry_segment(&self, id: Uuid) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ResetAndRetry { id, reply }).await?;
        rx.await.map_err(|_| OrchestratorError::Closed)?
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    async fn send(&self, cmd: Command) -> Result<(), OrchestratorError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| OrchestratorError::Closed)
    }
}

struct Coordinator {
    store: Arc<dyn SegmentStore>,
    remote: Arc<dyn TranscriptionBackend>,
    fallback: Arc<dyn TranscriptionBackend>,
    config: OrchestratorConfig,
    events: EventBus,
    jitter: Box<dyn JitterSource>,
    // Weak so the coordinator does not keep its own channel alive; spawned
    // tasks upgrade to a strong sender for their own lifetime.
    cmd_tx: mpsc::WeakSender<Command>,
    path: NetworkPath,
    running: bool,
    /// Non-terminal segments currently owned by the coordinator.
    segments: HashMap<Uuid, Segment>,
    /// Admitted segments waiting for a free slot, in arrival order.
    waiting: VecDeque<Uuid>,
    /// Segments holding a concurrency slot (status `Uploading`).
    uploading: HashSet<Uuid>,
    /// Segments with a local fallback attempt in flight.
    fallback_running: HashSet<Uuid>,
    completed_total: usize,
    failed_total: usize,
    snapshot: QueueSnapshot,
}

impl Coordinator {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            self.handle(cmd).await;
            self.refresh_snapshot();
        }
        debug!("coordinator loop ended");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start => self.handle_start().await,
            Command::Stop => self.handle_stop(),
            Command::Enqueue(segment) => self.handle_enqueue(segment).await,
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot);
            }
            Command::ResetAndRetry { id, reply } => {
                let result = self.handle_reset_and_retry(id).await;
                let _ = reply.send(result);
            }
            Command::NetworkChanged(path) => self.handle_network_changed(path).await,
            Command::RetryDue(id) => self.handle_retry_due(id).await,
            Command::AttemptDone { id, outcome } => self.handle_attempt_done(id, outcome).await,
            Command::FallbackDone { id, outcome } => self.handle_fallback_done(id, outcome).await,
        }
    }

    async fn handle_start(&mut self) {
        if self.running {
            debug!("start requested but orchestrator is already running");
            return;
        }
        self.running = true;
        info!("orchestrator resumed");
        self.events.publish(OrchestratorEvent::Resumed);

        self.drain_store().await;
        self.pump().await;
    }

    fn handle_stop(&mut self) {
        if !self.running {
            debug!("stop requested but orchestrator is already stopped");
            return;
        }
        self.running = false;
        info!("orchestrator paused; in-flight attempts will complete");
        self.events.publish(OrchestratorEvent::Paused);
    }

    /// Resume outstanding work left in the store by a previous run.
    async fn drain_store(&mut self) {
        let pending = match self.store.pending_segments().await {
            Ok(segments) => segments,
            Err(e) => {
                error!("failed to read pending segments from store: {:#}", e);
                Vec::new()
            }
        };
        for segment in pending {
            self.adopt_for_admission(segment);
        }

        // A previous process may have died mid-attempt; its records are
        // stuck in Uploading and nobody will ever finish them.
        match self.store.segments_with_status(SegmentStatus::Uploading).await {
            Ok(stale) => {
                for mut segment in stale {
                    if self.segments.contains_key(&segment.id) {
                        continue;
                    }
                    warn!("re-admitting segment {} left uploading by a previous run", segment.id);
                    segment.status = SegmentStatus::Pending;
                    self.persist(&segment).await;
                    self.adopt_for_admission(segment);
                }
            }
            Err(e) => error!("failed to scan stale uploads: {:#}", e),
        }

        match self
            .store
            .segments_with_status(SegmentStatus::QueuedOffline)
            .await
        {
            Ok(offline) => {
                for segment in offline {
                    self.segments.entry(segment.id).or_insert(segment);
                }
            }
            Err(e) => error!("failed to scan offline segments: {:#}", e),
        }

        if self.path.is_reachable {
            self.restore_offline().await;
        }
    }

    fn adopt_for_admission(&mut self, segment: Segment) {
        if self.segments.contains_key(&segment.id) {
            return;
        }
        let id = segment.id;
        self.segments.insert(id, segment);
        self.waiting.push_back(id);
        self.events.publish(OrchestratorEvent::Queued { segment_id: id });
    }

    async fn handle_enqueue(&mut self, segment: Segment) {
        if segment.status != SegmentStatus::Pending {
            warn!(
                "refusing to enqueue segment {} in status {}",
                segment.id, segment.status
            );
            return;
        }
        if self.segments.contains_key(&segment.id) {
            warn!("segment {} was already handed over; ignoring duplicate", segment.id);
            return;
        }

        if !self.running {
            // Parked: the record stays pending in the store and is drained
            // on the next start().
            self.persist(&segment).await;
            debug!("orchestrator stopped; segment {} parked as pending", segment.id);
            return;
        }

        if !self.path.is_reachable {
            let mut segment = segment;
            segment.status = SegmentStatus::QueuedOffline;
            self.persist(&segment).await;
            self.events.publish(OrchestratorEvent::QueuedOffline {
                segment_id: segment.id,
            });
            self.segments.insert(segment.id, segment);
            return;
        }

        self.persist(&segment).await;
        self.adopt_for_admission(segment);
        self.pump().await;
    }

    async fn handle_reset_and_retry(&mut self, id: Uuid) -> Result<(), OrchestratorError> {
        let stored = self.store.get_segment(id).await?;
        let Some(mut segment) = stored else {
            return Err(OrchestratorError::UnknownSegment(id));
        };
        if segment.status != SegmentStatus::Failed {
            return Err(OrchestratorError::NotRetryable(id));
        }

        segment.status = SegmentStatus::Pending;
        segment.failure_count = 0;
        segment.last_error = None;
        self.persist(&segment).await;
        info!("segment {} reset by operator", id);

        if self.running {
            self.adopt_for_admission(segment);
            self.pump().await;
        }
        Ok(())
    }

    async fn handle_network_changed(&mut self, path: NetworkPath) {
        let was_reachable = self.path.is_reachable;
        self.path = path;

        if was_reachable && !path.is_reachable {
            // In-flight attempts are left alone; only queued admissions are
            // rerouted to the offline path.
            let parked: Vec<Uuid> = self.waiting.drain(..).collect();
            for id in parked {
                self.mark_offline(id).await;
            }
        } else if !was_reachable && path.is_reachable {
            self.restore_offline().await;
        }
    }

    async fn restore_offline(&mut self) {
        let offline: Vec<Uuid> = self
            .segments
            .iter()
            .filter(|(_, s)| s.status == SegmentStatus::QueuedOffline)
            .map(|(id, _)| *id)
            .collect();

        for id in offline {
            let updated = {
                let Some(segment) = self.segments.get_mut(&id) else { continue };
                segment.status = SegmentStatus::Pending;
                segment.clone()
            };
            self.persist(&updated).await;

            if self.running {
                self.waiting.push_back(id);
                self.events.publish(OrchestratorEvent::Queued { segment_id: id });
            } else {
                // Parked in the store for the next start().
                self.segments.remove(&id);
            }
        }

        self.pump().await;
    }

    async fn handle_retry_due(&mut self, id: Uuid) {
        if !self.segments.contains_key(&id) {
            return;
        }
        if !self.running {
            // The timer outlived stop(); park the segment for the next
            // start() instead of attempting while stopped.
            self.segments.remove(&id);
            debug!("retry for segment {} fired while stopped; parked as pending", id);
            return;
        }
        if !self.path.is_reachable {
            self.mark_offline(id).await;
            return;
        }
        self.waiting.push_back(id);
        self.pump().await;
    }

    async fn handle_attempt_done(&mut self, id: Uuid, outcome: Result<String, AttemptFailure>) {
        self.uploading.remove(&id);

        match outcome {
            Ok(text) => self.complete(id, text, EngineKind::Remote).await,
            Err(failure) => {
                let Some(failure_count) = ({
                    self.segments.get_mut(&id).map(|segment| {
                        segment.failure_count += 1;
                        segment.last_error = Some(failure.message.clone());
                        segment.failure_count
                    })
                }) else {
                    warn!("attempt finished for unknown segment {}", id);
                    return;
                };

                warn!(
                    "remote attempt for segment {} failed ({} so far): {}",
                    id, failure_count, failure.message
                );
                self.events.publish(OrchestratorEvent::AttemptFailed {
                    segment_id: id,
                    failure_count,
                    error: failure.message.clone(),
                });

                if !failure.retryable {
                    // Cannot succeed without external intervention; skip the
                    // remaining retry budget and go straight to the fallback.
                    self.dispatch_fallback(id).await;
                } else {
                    let decision = self.config.retry.decide(failure_count, self.jitter.as_mut());
                    match decision {
                        RetryDecision::Delay(delay) => {
                            self.schedule_retry(id, failure_count, delay).await
                        }
                        RetryDecision::Fallback => self.dispatch_fallback(id).await,
                    }
                }
            }
        }

        self.pump().await;
    }

    async fn handle_fallback_done(&mut self, id: Uuid, outcome: Result<String, String>) {
        self.fallback_running.remove(&id);

        match outcome {
            Ok(text) => self.complete(id, text, EngineKind::Local).await,
            Err(message) => {
                let Some(updated) = ({
                    self.segments.get_mut(&id).map(|segment| {
                        segment.status = SegmentStatus::Failed;
                        segment.last_error = Some(message.clone());
                        segment.clone()
                    })
                }) else {
                    warn!("fallback finished for unknown segment {}", id);
                    return;
                };
                self.persist(&updated).await;
                self.segments.remove(&id);
                self.failed_total += 1;
                error!("segment {} failed terminally: {}", id, message);
                self.events.publish(OrchestratorEvent::FallbackFailed {
                    segment_id: id,
                    error: message,
                });
            }
        }

        self.pump().await;
    }

    async fn complete(&mut self, id: Uuid, text: String, engine: EngineKind) {
        let Some(updated) = ({
            self.segments.get_mut(&id).map(|segment| {
                segment.status = SegmentStatus::Transcribed;
                segment.transcript = Some(text);
                segment.last_error = None;
                segment.clone()
            })
        }) else {
            warn!("completion for unknown segment {}", id);
            return;
        };
        self.persist(&updated).await;
        self.segments.remove(&id);
        self.completed_total += 1;
        info!("segment {} transcribed via {:?} backend", id, engine);
        self.events.publish(OrchestratorEvent::Completed {
            segment_id: id,
            engine,
        });
    }

    /// Admit waiting segments into free slots, or reroute them offline if
    /// the network went away.
    async fn pump(&mut self) {
        if !self.running {
            return;
        }
        if !self.path.is_reachable {
            let parked: Vec<Uuid> = self.waiting.drain(..).collect();
            for id in parked {
                self.mark_offline(id).await;
            }
            return;
        }
        while self.uploading.len() < self.config.concurrency_limit {
            let Some(id) = self.waiting.pop_front() else { break };
            self.begin_attempt(id).await;
        }
    }

    async fn begin_attempt(&mut self, id: Uuid) {
        let Some((updated, audio_path, ctx)) = ({
            self.segments.get_mut(&id).map(|segment| {
                segment.status = SegmentStatus::Uploading;
                (
                    segment.clone(),
                    segment.audio_path.clone(),
                    SegmentContext {
                        session_id: segment.session_id,
                        segment_index: segment.index,
                    },
                )
            })
        }) else {
            warn!("admission of unknown segment {}", id);
            return;
        };
        self.persist(&updated).await;
        self.uploading.insert(id);
        self.events.publish(OrchestratorEvent::Started { segment_id: id });

        let Some(tx) = self.cmd_tx.upgrade() else { return };
        let backend = Arc::clone(&self.remote);
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let outcome = run_attempt(backend, audio_path, ctx, timeout).await;
            let _ = tx.send(Command::AttemptDone { id, outcome }).await;
        });
    }

    async fn schedule_retry(&mut self, id: Uuid, failure_count: u32, delay: Duration) {
        let Some(updated) = ({
            self.segments.get_mut(&id).map(|segment| {
                segment.status = SegmentStatus::Pending;
                segment.clone()
            })
        }) else {
            return;
        };
        self.persist(&updated).await;
        self.events.publish(OrchestratorEvent::RetryScheduled {
            segment_id: id,
            attempt: failure_count + 1,
            delay,
        });

        // The timer holds a strong sender: a scheduled retry survives both
        // stop() and the handle being dropped, and re-enters the normal
        // admission path when it fires.
        let Some(tx) = self.cmd_tx.upgrade() else { return };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::RetryDue(id)).await;
        });
    }

    async fn dispatch_fallback(&mut self, id: Uuid) {
        let Some((updated, audio_path, ctx)) = ({
            self.segments.get_mut(&id).map(|segment| {
                // Uploading is reserved for slot-holding remote attempts;
                // the fallback runs without a slot.
                segment.status = SegmentStatus::Pending;
                (
                    segment.clone(),
                    segment.audio_path.clone(),
                    SegmentContext {
                        session_id: segment.session_id,
                        segment_index: segment.index,
                    },
                )
            })
        }) else {
            return;
        };
        self.persist(&updated).await;
        self.fallback_running.insert(id);
        info!("dispatching segment {} to the local fallback engine", id);
        self.events.publish(OrchestratorEvent::FallbackStarted { segment_id: id });

        let Some(tx) = self.cmd_tx.upgrade() else { return };
        let backend = Arc::clone(&self.fallback);
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let outcome = match run_attempt(backend, audio_path, ctx, timeout).await {
                Ok(text) => Ok(text),
                Err(failure) => Err(failure.message),
            };
            let _ = tx.send(Command::FallbackDone { id, outcome }).await;
        });
    }

    async fn mark_offline(&mut self, id: Uuid) {
        let Some(updated) = ({
            self.segments.get_mut(&id).map(|segment| {
                segment.status = SegmentStatus::QueuedOffline;
                segment.clone()
            })
        }) else {
            return;
        };
        self.persist(&updated).await;
        self.events.publish(OrchestratorEvent::QueuedOffline { segment_id: id });
    }

    async fn persist(&self, segment: &Segment) {
        if let Err(e) = self.store.put_segment(segment).await {
            // The in-memory copy stays authoritative; the next transition
            // retries the write.
            error!("failed to persist segment {}: {:#}", segment.id, e);
        }
    }

    /// Recompute the derived counts from coordinator-owned state. Runs after
    /// every command, so the published snapshot can never drift from the
    /// statuses it is derived from.
    fn refresh_snapshot(&mut self) {
        let pending = self
            .segments
            .values()
            .filter(|s| s.status == SegmentStatus::Pending)
            .count();
        let offline = self
            .segments
            .values()
            .filter(|s| s.status == SegmentStatus::QueuedOffline)
            .count();

        let snapshot = QueueSnapshot {
            // Fallback runs keep their record Pending but are processing,
            // not queued.
            queued: pending.saturating_sub(self.fallback_running.len()),
            processing: self.uploading.len() + self.fallback_running.len(),
            completed: self.completed_total,
            failed: self.failed_total,
            offline,
        };

        if snapshot != self.snapshot {
            self.snapshot = snapshot;
            self.events
                .publish(OrchestratorEvent::SnapshotChanged(snapshot));
        }
    }
}

/// One attempt against one backend: read the referenced audio, call the
/// backend under a timeout, and fold every failure mode into
/// [`AttemptFailure`].
async fn run_attempt(
    backend: Arc<dyn TranscriptionBackend>,
    audio_path: PathBuf,
    ctx: SegmentContext,
    timeout: Duration,
) -> Result<String, AttemptFailure> {
    let audio = tokio::fs::read(&audio_path).await.map_err(|e| AttemptFailure {
        // Unified with transport errors: a missing chunk file is handled
        // exactly like an unreachable server.
        retryable: true,
        message: format!("failed to read audio {}: {}", audio_path.display(), e),
    })?;

    match tokio::time::timeout(timeout, backend.transcribe(&audio, &ctx)).await {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(AttemptFailure {
            retryable: e.is_retryable(),
            message: e.to_string(),
        }),
        Err(_) => Err(AttemptFailure {
            retryable: true,
            message: format!("{} attempt timed out after {:?}", backend.name(), timeout),
        }),
    }
}
