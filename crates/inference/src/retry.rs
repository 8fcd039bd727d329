//! Retry policy for model loading and classification of final load failures.

use kiln_config::RetryConfig;
use kiln_core::{LoadFailureCause, RuntimeError};
use std::time::Duration;

/// Exponential backoff: after failed attempt `n` (0-based) wait
/// `initial_backoff * multiplier^n` before the next one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// Three attempts on a 1s, 2s, 4s schedule.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Retries without sleeping in between.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay after failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(self.initial_backoff.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.multiplier,
        }
    }
}

/// Reduce a runtime error to the cause shown to users.
///
/// Typed runtime errors map directly; free-form ones are matched on the
/// phrases model hubs and HTTP stacks use.
pub fn classify(err: &RuntimeError) -> LoadFailureCause {
    match err {
        RuntimeError::NotFound(_) => LoadFailureCause::NotFound,
        RuntimeError::Network(_) => LoadFailureCause::Network,
        RuntimeError::Inference(msg) | RuntimeError::Other(msg) => {
            let lower = msg.to_lowercase();
            const NOT_FOUND: [&str; 5] = [
                "cannot find the requested files",
                "locate the file on the hub",
                "no such file",
                "not found",
                "404",
            ];
            const NETWORK: [&str; 5] = ["connection", "network", "timed out", "dns", "unreachable"];

            if NOT_FOUND.iter().any(|p| lower.contains(p)) {
                LoadFailureCause::NotFound
            } else if NETWORK.iter().any(|p| lower.contains(p)) {
                LoadFailureCause::Network
            } else {
                LoadFailureCause::Unknown
            }
        }
    }
}

/// Human-readable explanation for a classified load failure.
pub fn describe(cause: LoadFailureCause, model_path: &str, err: &RuntimeError) -> String {
    match cause {
        LoadFailureCause::NotFound => format!(
            "Model '{model_path}' not found. Check the model path or repository name."
        ),
        LoadFailureCause::Network => format!(
            "Network error while loading '{model_path}'. Check your internet connection."
        ),
        LoadFailureCause::Unknown => format!("Failed to load model '{model_path}': {err}"),
    }
}
