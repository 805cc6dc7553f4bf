use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{BackendError, SegmentContext, TranscriptionBackend};

/// Stateless client for the remote transcription API.
///
/// One call is one attempt: retry scheduling lives in the orchestrator, not
/// here. A missing credential fails before any network I/O.
pub struct RemoteTranscriber {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct TranscribeRequest<'a> {
    session_id: Uuid,
    segment_index: u32,
    audio: &'a str,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
}

impl RemoteTranscriber {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }
}

#[async_trait]
impl TranscriptionBackend for RemoteTranscriber {
    async fn transcribe(
        &self,
        audio: &[u8],
        ctx: &SegmentContext,
    ) -> Result<String, BackendError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(BackendError::MissingCredential)?;

        let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
        let body = TranscribeRequest {
            session_id: ctx.session_id,
            segment_index: ctx.segment_index,
            audio: &encoded,
        };

        debug!(
            "uploading segment {} of session {} ({} bytes)",
            ctx.segment_index,
            ctx.session_id,
            audio.len()
        );

        let response = self
            .client
            .post(format!("{}/v1/transcribe", self.endpoint))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Http {
                status: status.as_u16(),
            });
        }

        let parsed: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        if parsed.text.is_empty() {
            return Err(BackendError::InvalidResponse(
                "response carried no transcript text".to_string(),
            ));
        }

        Ok(parsed.text)
    }

    fn name(&self) -> &str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SegmentContext {
        SegmentContext {
            session_id: Uuid::new_v4(),
            segment_index: 0,
        }
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_io() {
        // Endpoint is unroutable on purpose: the call must fail on the
        // credential check, not on the network.
        let backend = RemoteTranscriber::new(
            "http://192.0.2.1:1".to_string(),
            None,
            Duration::from_secs(1),
        );

        let err = backend.transcribe(&[0u8; 4], &ctx()).await.unwrap_err();
        assert!(matches!(err, BackendError::MissingCredential));
    }

    #[tokio::test]
    async fn test_empty_credential_treated_as_missing() {
        let backend = RemoteTranscriber::new(
            "http://192.0.2.1:1".to_string(),
            Some(String::new()),
            Duration::from_secs(1),
        );

        let err = backend.transcribe(&[0u8; 4], &ctx()).await.unwrap_err();
        assert!(matches!(err, BackendError::MissingCredential));
    }

    #[test]
    fn test_name() {
        let backend =
            RemoteTranscriber::new("http://localhost", Some("k".into()), Duration::from_secs(1));
        assert_eq!(backend.name(), "remote");
    }
}
