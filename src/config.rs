use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tunables for the orchestrator core.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of segments simultaneously holding an upload slot.
    pub concurrency_limit: usize,
    /// Backoff policy for failed remote attempts.
    pub retry: RetryPolicy,
    /// Hard timeout applied to each backend attempt (remote or fallback).
    pub request_timeout: Duration,
    /// Event bus capacity (events buffered per lagging subscriber).
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 3,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.concurrency_limit, 3);
        assert_eq!(config.retry.max_retries_before_fallback, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }
}
