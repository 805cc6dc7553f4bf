//! Murmur Orchestrator - segment transcription orchestration
//!
//! This crate drives short, sequential units of recorded audio ("segments")
//! through an unreliable remote transcription service. It features:
//!
//! - A single serialized coordinator owning every segment's lifecycle
//! - Bounded upload concurrency (default 3 simultaneous attempts)
//! - Exponential backoff with jitter for transient failures
//! - Offline queuing driven by a network reachability monitor
//! - A local fallback engine once the remote retry budget is exhausted
//! - Sled-backed durable segment/session records
//! - A broadcast event stream as the sole observability surface
//!
//! # Example
//!
//! ```no_run
//! use murmur_orchestrator::{
//!     backend::{LocalTranscriber, RemoteTranscriber},
//!     config::OrchestratorConfig,
//!     orchestrator::Orchestrator,
//!     reachability::{NetworkPath, ReachabilityMonitor},
//!     store::SledSegmentStore,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SledSegmentStore::new("/var/lib/murmur/segments")?);
//!     let remote = Arc::new(RemoteTranscriber::new(
//!         "https://transcribe.example.com",
//!         std::env::var("MURMUR_API_KEY").ok(),
//!         Duration::from_secs(30),
//!     ));
//!     let fallback = Arc::new(LocalTranscriber::new(
//!         "whisper-cli",
//!         vec!["--model".into(), "base.en".into()],
//!         "/tmp/murmur/scratch".into(),
//!     ));
//!     let monitor = ReachabilityMonitor::new(NetworkPath::default());
//!
//!     let orchestrator = Orchestrator::new(
//!         store,
//!         remote,
//!         fallback,
//!         monitor.subscribe(),
//!         OrchestratorConfig::default(),
//!     );
//!     orchestrator.start().await?;
//!
//!     // Segments arrive from the producer and are enqueued here; results
//!     // flow out through orchestrator.subscribe() and the store.
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod protocol;
pub mod reachability;
pub mod retry;
pub mod store;

// Re-export commonly used types for convenience
pub use backend::{BackendError, LocalTranscriber, RemoteTranscriber, TranscriptionBackend};
pub use config::OrchestratorConfig;
pub use events::{EngineKind, EventBus, OrchestratorEvent};
pub use orchestrator::Orchestrator;
pub use protocol::{QueueSnapshot, Segment, SegmentStatus, Session};
pub use reachability::{ConnectionType, NetworkPath, ReachabilityMonitor};
pub use retry::{JitterSource, RetryDecision, RetryPolicy};
pub use store::{SegmentStore, SledSegmentStore};

// Error types
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the orchestrator handle.
///
/// Backend failures never appear here: those are converted internally and
/// reported through the event stream and the persisted segment records.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The segment handed to `enqueue` was not in `Pending` state.
    #[error("segment {id} is not pending (status: {status})")]
    NotPending {
        id: Uuid,
        status: protocol::SegmentStatus,
    },

    /// Operator retry referenced a segment the store has never seen.
    #[error("unknown segment: {0}")]
    UnknownSegment(Uuid),

    /// Operator retry referenced a segment that is not terminally failed.
    #[error("segment {0} is not in a failed state")]
    NotRetryable(Uuid),

    /// The coordinator task is gone.
    #[error("orchestrator is no longer running")]
    Closed,

    /// Store operation failed
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Utility functions for common operations
pub mod utils {
    use crate::protocol::Segment;

    /// Generate a minimal mono 16-bit PCM WAV payload with a 440 Hz tone.
    /// Useful wherever tests or tools need a plausible audio reference.
    pub fn synthetic_wav(duration_seconds: f64, sample_rate: u32) -> Vec<u8> {
        let sample_count = (duration_seconds * sample_rate as f64) as u32;
        let data_len = sample_count * 2;
        let mut out = Vec::with_capacity(44 + data_len as usize);

        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&1u16.to_le_bytes()); // mono
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());

        for i in 0..sample_count {
            let t = i as f64 / sample_rate as f64;
            let sample = ((t * 440.0 * 2.0 * std::f64::consts::PI).sin() * 0.1 * 32767.0) as i16;
            out.extend_from_slice(&sample.to_le_bytes());
        }

        out
    }

    /// Validate segment parameters before hand-off.
    pub fn validate_segment(segment: &Segment) -> bool {
        !segment.duration.is_zero() && segment.audio_path.as_os_str().len() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_version_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "murmur-orchestrator");
    }

    #[test]
    fn test_synthetic_wav_shape() {
        let wav = synthetic_wav(1.0, 8000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 8000 * 2);
    }

    #[test]
    fn test_segment_validation() {
        let valid = Segment::new(
            uuid::Uuid::new_v4(),
            0,
            Duration::ZERO,
            Duration::from_secs(30),
            PathBuf::from("/tmp/chunk.wav"),
        );
        assert!(validate_segment(&valid));

        let mut invalid = valid.clone();
        invalid.duration = Duration::ZERO;
        assert!(!validate_segment(&invalid));

        let mut empty_path = valid;
        empty_path.audio_path = PathBuf::new();
        assert!(!validate_segment(&empty_path));
    }
}
