//! Transcription backends.
//!
//! The orchestrator talks to exactly one capability: "turn audio bytes into
//! text". Two interchangeable implementations exist — the remote API client
//! and the on-device fallback engine — selected by the orchestrator core,
//! never by the callers.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod local;
pub mod remote;

pub use local::LocalTranscriber;
pub use remote::RemoteTranscriber;

/// Errors a transcription backend can produce.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Transport-level failure (connect, DNS, timeout, dropped connection).
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("server returned HTTP {status}")]
    Http { status: u16 },

    /// The server answered but the body was not usable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// No credential configured; the request was never sent.
    #[error("missing API credential")]
    MissingCredential,

    /// The local engine failed.
    #[error("engine error: {0}")]
    Engine(String),
}

impl BackendError {
    /// Whether another attempt against the same backend could plausibly
    /// succeed without external intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Network(_) => true,
            BackendError::Http { status } => *status >= 500,
            BackendError::InvalidResponse(_) => true,
            BackendError::MissingCredential => false,
            BackendError::Engine(_) => false,
        }
    }
}

/// Request metadata accompanying the audio bytes.
///
/// The remote service uses it for transcript alignment; the local engine
/// ignores it.
#[derive(Debug, Clone, Copy)]
pub struct SegmentContext {
    pub session_id: Uuid,
    pub segment_index: u32,
}

/// A transcription capability: audio bytes in, transcript text out.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    async fn transcribe(&self, audio: &[u8], ctx: &SegmentContext)
        -> Result<String, BackendError>;

    /// Short identifier used in logs.
    fn name(&self) -> &str;
}
