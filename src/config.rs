use std::time::Duration;

use serde::Deserialize;

use crate::error::MuxError;

/// Runtime configuration for the multiplexer. Parsed once at startup; none of
/// the fields are re-read from their source after construction.
///
/// Defaults match the llama.cpp backend this crate fronts: 8 concurrent
/// slots, a 50-task queue, 100 sessions with a 5 minute idle timeout, and a
/// 256-token protected prefix for context shifting.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Maximum number of tasks running against the engine simultaneously.
    pub max_concurrent: usize,
    /// Queue capacity across all priority tiers.
    pub queue_size: usize,
    /// Maximum number of live (idle or running) sessions.
    pub max_sessions: usize,
    /// Idle sessions older than this are evicted by the sweep.
    pub idle_timeout_ms: u64,
    /// Evict the least-recently-used idle session instead of failing when the
    /// session table is full.
    pub auto_cleanup: bool,
    /// Context window size in tokens.
    pub ctx_size: usize,
    /// Tokens at the start of a context that are never discarded by shifting
    /// (typically the system prompt).
    pub n_keep: usize,
    /// How long a model swap waits for in-flight tasks before aborting.
    pub drain_timeout_ms: u64,
    /// A queued task waiting longer than this is promoted one priority tier.
    pub starvation_threshold_ms: u64,
    /// Dequeue grants per scheduling cycle for HIGH, NORMAL, LOW.
    pub priority_weights: [u32; 3],
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            queue_size: 50,
            max_sessions: 100,
            idle_timeout_ms: 300_000,
            auto_cleanup: true,
            ctx_size: 4096,
            n_keep: 256,
            drain_timeout_ms: 30_000,
            starvation_threshold_ms: 5_000,
            priority_weights: [4, 2, 1],
        }
    }
}

impl MuxConfig {
    /// Reject configurations the scheduler cannot run with. An oversized
    /// `n_keep` is clamped to half the window rather than rejected, matching
    /// llama.cpp's handling.
    pub fn validate(mut self) -> Result<Self, MuxError> {
        if self.max_concurrent == 0 || self.queue_size == 0 || self.ctx_size == 0 {
            return Err(MuxError::LoadFailed(
                "max_concurrent, queue_size and ctx_size must be non-zero".into(),
            ));
        }
        if self.priority_weights.iter().all(|&w| w == 0) {
            return Err(MuxError::LoadFailed(
                "at least one priority weight must be non-zero".into(),
            ));
        }
        if self.n_keep >= self.ctx_size {
            self.n_keep = self.ctx_size / 2;
        }
        Ok(self)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn starvation_threshold(&self) -> Duration {
        Duration::from_millis(self.starvation_threshold_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_backend() {
        let config = MuxConfig::default();
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.queue_size, 50);
        assert_eq!(config.max_sessions, 100);
        assert_eq!(config.idle_timeout_ms, 300_000);
        assert!(config.auto_cleanup);
        assert_eq!(config.n_keep, 256);
        assert_eq!(config.priority_weights, [4, 2, 1]);
    }

    #[test]
    fn parse_partial_json() {
        let config: MuxConfig = serde_json::from_str(
            r#"{
                "max_concurrent": 1,
                "queue_size": 16,
                "priority_weights": [8, 4, 2]
            }"#,
        )
        .expect("failed to parse config");

        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.queue_size, 16);
        assert_eq!(config.priority_weights, [8, 4, 2]);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.max_sessions, 100);
        assert_eq!(config.ctx_size, 4096);
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let config = MuxConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_all_zero_weights() {
        let config = MuxConfig {
            priority_weights: [0, 0, 0],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_clamps_oversized_n_keep() {
        let config = MuxConfig {
            ctx_size: 512,
            n_keep: 1024,
            ..Default::default()
        };
        let config = config.validate().expect("valid config");
        assert_eq!(config.n_keep, 256);
    }
}
