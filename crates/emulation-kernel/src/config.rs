//! Configuration types for the kernel.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level kernel configuration.
///
/// Loaded from JSON at runtime; every section falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Global barrier settings
    pub barrier: BarrierConfig,

    /// Coordinator → handler delivery policy
    pub transport: RetryPolicy,

    /// Action execution settings used by handlers
    pub actions: ActionConfig,

    /// Abort propagation
    pub abort: AbortConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierConfig {
    /// Slack added after the last arrival before positive time begins
    pub buffer_seconds: f64,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 5.0,
        }
    }
}

/// Bounded exponential backoff for handler delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Uniform random jitter added to each wait
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            jitter_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    /// Applied to run actions that carry no timeout of their own; `None`
    /// waits indefinitely
    pub default_timeout_seconds: Option<f64>,

    /// File an action creates in its working directory to request a reboot
    pub reboot_sentinel: String,

    /// Exit code an action uses to request a reboot
    pub reboot_exit_code: i32,

    /// Reboot rounds allowed within one negative-time bucket
    pub max_reboots_per_bucket: u32,

    /// Root under which per-vertex working directories are created
    pub work_root: PathBuf,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: None,
            reboot_sentinel: ".reboot-requested".to_string(),
            reboot_exit_code: 199,
            max_reboots_per_bucket: 4,
            work_root: std::env::temp_dir().join("emulation-kernel"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbortConfig {
    /// How long the coordinator waits for handlers to acknowledge an abort
    pub ack_timeout_ms: u64,
}

impl Default for AbortConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: KernelConfig =
            serde_json::from_str(r#"{"barrier": {"buffer_seconds": 1.5}, "transport": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(config.barrier.buffer_seconds, 1.5);
        assert_eq!(config.transport.max_attempts, 2);
        assert_eq!(config.transport.initial_backoff_ms, 200);
        assert_eq!(config.actions.reboot_exit_code, 199);
        assert!(config.actions.default_timeout_seconds.is_none());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(5_000));
    }
}
