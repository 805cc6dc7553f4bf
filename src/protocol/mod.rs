use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle status of a segment.
///
/// Valid transitions form a small machine:
/// `Pending -> Uploading -> {Transcribed | Failed | QueuedOffline}` plus the
/// re-queue edges `Uploading -> Pending` (scheduled retry) and
/// `QueuedOffline -> Pending` (network restored). `Transcribed` and `Failed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    /// Waiting for admission (fresh, re-queued for retry, or parked by stop).
    Pending,
    /// Holding a concurrency slot; a remote attempt is in flight.
    Uploading,
    /// Transcript persisted; terminal.
    Transcribed,
    /// Retry budget and fallback both exhausted; terminal.
    Failed,
    /// Parked because the network was unreachable at admission time.
    QueuedOffline,
}

impl SegmentStatus {
    /// Whether no further automatic transition can occur from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SegmentStatus::Transcribed | SegmentStatus::Failed)
    }

    /// Whether a transition from `self` to `next` is allowed by the machine.
    pub fn can_transition_to(&self, next: SegmentStatus) -> bool {
        use SegmentStatus::*;
        match (self, next) {
            (Pending, Uploading) | (Pending, QueuedOffline) => true,
            (Uploading, Transcribed) | (Uploading, Failed) | (Uploading, Pending) => true,
            (Uploading, QueuedOffline) => true,
            (QueuedOffline, Pending) => true,
            // Operator reset of a failed segment.
            (Failed, Pending) => true,
            // A pending segment can complete or fail through the fallback
            // path without re-entering Uploading.
            (Pending, Transcribed) | (Pending, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SegmentStatus::Pending => "pending",
            SegmentStatus::Uploading => "uploading",
            SegmentStatus::Transcribed => "transcribed",
            SegmentStatus::Failed => "failed",
            SegmentStatus::QueuedOffline => "queued_offline",
        };
        f.write_str(s)
    }
}

/// A bounded slice of a recording session with its own transcription
/// lifecycle.
///
/// The segment references its audio bytes by path; it never owns them. All
/// mutable fields (`status`, `failure_count`, `last_error`, `transcript`)
/// are written only by the orchestrator, or by an explicit operator reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// Unique identifier for this segment
    pub id: Uuid,
    /// Session this segment belongs to
    pub session_id: Uuid,
    /// Ordinal index within the session (unique, monotonically increasing)
    pub index: u32,
    /// Offset of this segment from the session start
    pub start_offset: Duration,
    /// Duration of the recorded audio
    pub duration: Duration,
    /// Reference to the audio bytes on disk (not owned by the orchestrator)
    pub audio_path: PathBuf,
    /// Transcript text, once some backend produced one
    pub transcript: Option<String>,
    /// Current lifecycle status
    pub status: SegmentStatus,
    /// Number of failed remote attempts so far
    pub failure_count: u32,
    /// Human-readable description of the most recent failure
    pub last_error: Option<String>,
    /// Timestamp when the segment was created by the producer
    pub created_at: DateTime<Utc>,
}

impl Segment {
    /// Create a new pending segment.
    pub fn new(
        session_id: Uuid,
        index: u32,
        start_offset: Duration,
        duration: Duration,
        audio_path: PathBuf,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            index,
            start_offset,
            duration,
            audio_path,
            transcript: None,
            status: SegmentStatus::Pending,
            failure_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Serialize this segment to MessagePack format
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize from MessagePack format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// A recording session: an ordered collection of segments.
///
/// Sessions exist for lifecycle and display purposes; the orchestrator
/// processes segments without regard to session boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier for this session
    pub id: Uuid,
    /// Display title
    pub title: String,
    /// When recording started
    pub started_at: DateTime<Utc>,
    /// When recording ended, if it has
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a new session starting now.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Serialize this session to MessagePack format
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize from MessagePack format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Derived queue counts, maintained incrementally by the orchestrator.
///
/// This is a cache for cheap introspection, not a source of truth; it must
/// always be re-derivable from the segment statuses the orchestrator owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Segments admitted or scheduled but not yet holding a slot
    pub queued: usize,
    /// Segments with an attempt (remote or fallback) in flight
    pub processing: usize,
    /// Segments that reached `Transcribed` since the orchestrator started
    pub completed: usize,
    /// Segments that reached `Failed` since the orchestrator started
    pub failed: usize,
    /// Segments parked as `QueuedOffline`
    pub offline: usize,
}

impl std::fmt::Display for QueueSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "queued={}, processing={}, completed={}, failed={}, offline={}",
            self.queued, self.processing, self.completed, self.failed, self.offline
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_segment() -> Segment {
        Segment::new(
            Uuid::new_v4(),
            3,
            Duration::from_secs(90),
            Duration::from_secs(30),
            PathBuf::from("/tmp/murmur/session/003.wav"),
        )
    }

    #[test]
    fn test_segment_serialization() {
        let segment = sample_segment();

        let bytes = segment.to_bytes().unwrap();
        let deserialized = Segment::from_bytes(&bytes).unwrap();

        assert_eq!(segment.id, deserialized.id);
        assert_eq!(segment.index, deserialized.index);
        assert_eq!(segment.audio_path, deserialized.audio_path);
        assert_eq!(segment.status, deserialized.status);
        assert_eq!(segment.failure_count, deserialized.failure_count);
    }

    #[test]
    fn test_session_serialization() {
        let session = Session::new("Standup notes");

        let bytes = session.to_bytes().unwrap();
        let deserialized = Session::from_bytes(&bytes).unwrap();

        assert_eq!(session.id, deserialized.id);
        assert_eq!(session.title, deserialized.title);
        assert!(deserialized.ended_at.is_none());
    }

    #[test]
    fn test_new_segment_is_pending() {
        let segment = sample_segment();
        assert_eq!(segment.status, SegmentStatus::Pending);
        assert_eq!(segment.failure_count, 0);
        assert!(segment.transcript.is_none());
        assert!(segment.last_error.is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SegmentStatus::Transcribed.is_terminal());
        assert!(SegmentStatus::Failed.is_terminal());
        assert!(!SegmentStatus::Pending.is_terminal());
        assert!(!SegmentStatus::Uploading.is_terminal());
        assert!(!SegmentStatus::QueuedOffline.is_terminal());
    }

    #[test]
    fn test_valid_transitions() {
        use SegmentStatus::*;

        assert!(Pending.can_transition_to(Uploading));
        assert!(Pending.can_transition_to(QueuedOffline));
        assert!(Uploading.can_transition_to(Transcribed));
        assert!(Uploading.can_transition_to(Failed));
        assert!(Uploading.can_transition_to(Pending));
        assert!(QueuedOffline.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));
    }

    #[test]
    fn test_no_transition_out_of_transcribed() {
        use SegmentStatus::*;

        for next in [Pending, Uploading, Failed, QueuedOffline, Transcribed] {
            assert!(!Transcribed.can_transition_to(next));
        }
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = QueueSnapshot {
            queued: 2,
            processing: 3,
            completed: 10,
            failed: 1,
            offline: 0,
        };
        let rendered = snapshot.to_string();
        assert!(rendered.contains("queued=2"));
        assert!(rendered.contains("processing=3"));
    }
}
