use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BackendError, SegmentContext, TranscriptionBackend};

/// On-device fallback engine.
///
/// Runs a configured external transcription binary (a whisper.cpp-style CLI)
/// against a spooled copy of the audio and reads the transcript from stdout.
/// No network, no credentials.
pub struct LocalTranscriber {
    command: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
}

impl LocalTranscriber {
    /// `command` and `args` form the engine invocation; the audio file path
    /// is appended as the final argument. `scratch_dir` receives the spooled
    /// audio files.
    pub fn new(command: impl Into<String>, args: Vec<String>, scratch_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            args,
            scratch_dir,
        }
    }

    async fn spool_audio(&self, audio: &[u8]) -> Result<PathBuf, BackendError> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| BackendError::Engine(format!("failed to create scratch dir: {}", e)))?;

        let path = self.scratch_dir.join(format!("{}.wav", Uuid::new_v4()));
        tokio::fs::write(&path, audio)
            .await
            .map_err(|e| BackendError::Engine(format!("failed to spool audio: {}", e)))?;

        Ok(path)
    }
}

#[async_trait]
impl TranscriptionBackend for LocalTranscriber {
    async fn transcribe(
        &self,
        audio: &[u8],
        _ctx: &SegmentContext,
    ) -> Result<String, BackendError> {
        let audio_path = self.spool_audio(audio).await?;

        debug!(
            "running local engine '{}' on {}",
            self.command,
            audio_path.display()
        );

        let output = Command::new(&self.command)
            .args(&self.args)
            .arg(&audio_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        // Scratch file is ours regardless of outcome.
        if let Err(e) = tokio::fs::remove_file(&audio_path).await {
            warn!("failed to remove spooled audio {}: {}", audio_path.display(), e);
        }

        let output = output
            .map_err(|e| BackendError::Engine(format!("failed to spawn engine: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Engine(format!(
                "engine exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(BackendError::Engine(
                "engine produced no transcript".to_string(),
            ));
        }

        Ok(text)
    }

    fn name(&self) -> &str {
        "local"
    }
}
