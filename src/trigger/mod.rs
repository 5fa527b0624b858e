//! Trigger - Relay Pulse Action
//!
//! Fires the physical deterrent by spawning the configured relay command
//! (GPIO specifics live behind that command). The trigger is fire-and-
//! forget for its callers, but a guard flag prevents overlapping pulses
//! from piling up when the control loop fires again while a pulse is
//! still executing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Trigger configuration
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Relay command template; `{pulse_ms}` is substituted if present
    pub command: String,
    /// Pulse length used when the caller does not specify one
    pub default_pulse_ms: u64,
    /// Hard deadline on the relay command itself
    pub timeout: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            command: "python3 scripts/relecko.py pulse {pulse_ms}".to_string(),
            default_pulse_ms: 500,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Trigger instance
pub struct Trigger {
    config: TriggerConfig,
    firing: AtomicBool,
}

impl Trigger {
    /// Create new Trigger
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            firing: AtomicBool::new(false),
        }
    }

    /// Whether a pulse is currently executing
    pub fn is_firing(&self) -> bool {
        self.firing.load(Ordering::SeqCst)
    }

    /// Fire one relay pulse in the background. Returns false (and does
    /// nothing) if a pulse is already executing.
    pub fn fire(self: &Arc<Self>, pulse_ms: Option<u64>) -> bool {
        if self.firing.swap(true, Ordering::SeqCst) {
            tracing::warn!("Trigger already firing, pulse ignored");
            return false;
        }

        let pulse_ms = pulse_ms.unwrap_or(self.config.default_pulse_ms);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_pulse(pulse_ms).await;
            this.firing.store(false, Ordering::SeqCst);
        });
        true
    }

    async fn run_pulse(&self, pulse_ms: u64) {
        let command = self
            .config
            .command
            .replace("{pulse_ms}", &pulse_ms.to_string());
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            tracing::error!("Empty trigger command");
            return;
        };

        tracing::info!(pulse_ms = pulse_ms, command = %command, "Trigger fired");

        let child = Command::new(program)
            .args(parts)
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "Trigger spawn failed");
                return;
            }
        };

        // On timeout the future is dropped and kill_on_drop reaps the child.
        match tokio::time::timeout(self.config.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                tracing::debug!(pulse_ms = pulse_ms, "Trigger pulse complete");
            }
            Ok(Ok(status)) => {
                tracing::warn!(status = %status, "Trigger command failed");
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Trigger wait failed");
            }
            Err(_) => {
                tracing::warn!("Trigger command timed out, killed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger_with(command: &str) -> Arc<Trigger> {
        Arc::new(Trigger::new(TriggerConfig {
            command: command.to_string(),
            default_pulse_ms: 100,
            timeout: Duration::from_secs(2),
        }))
    }

    #[tokio::test]
    async fn test_overlapping_fires_are_rejected() {
        let trigger = trigger_with("sleep 0.2");

        assert!(trigger.fire(None));
        assert!(!trigger.fire(None));
        assert!(trigger.is_firing());
    }

    #[tokio::test]
    async fn test_guard_clears_after_pulse() {
        let trigger = trigger_with("true");

        assert!(trigger.fire(None));
        for _ in 0..50 {
            if !trigger.is_firing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!trigger.is_firing());
        assert!(trigger.fire(None));
    }

    #[tokio::test]
    async fn test_spawn_failure_clears_guard() {
        let trigger = trigger_with("/nonexistent/relay-binary");

        assert!(trigger.fire(Some(50)));
        for _ in 0..50 {
            if !trigger.is_firing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!trigger.is_firing());
    }
}
