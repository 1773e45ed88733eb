//! Checkpoint pacing configuration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// The default checkpoint period, in milliseconds.
///
/// This is a pure initializer value for [`CheckpointConfig`], never
/// consulted as a runtime ceiling — a management command can set the live
/// period arbitrarily high or low; this constant only seeds the default.
pub const DEFAULT_PERIOD_MS: u64 = 10_000;

/// The floor pacing enforces on the live period, regardless of what a
/// management command set it to.
pub const MIN_PERIOD_MS: u64 = 100;

/// Env var read once, at first access, to override [`DEFAULT_PERIOD_MS`].
pub const PERIOD_MS_ENV_VAR: &str = "COLO_CHECKPOINT_PERIOD_MS";

/// Live, mutable checkpoint pacing state shared between the management
/// surface and the checkpoint loop.
///
/// Modeled after the teacher's `ExecutionSettings`: a small struct read at
/// startup (here, lazily on first [`CheckpointConfig::global`] call) from an
/// env var, then mutated in place for the life of the process via atomics
/// rather than replaced wholesale.
#[derive(Debug)]
pub struct CheckpointConfig {
    period_ms: AtomicU64,
}

impl CheckpointConfig {
    fn from_env() -> Self {
        let period_ms = std::env::var(PERIOD_MS_ENV_VAR)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_PERIOD_MS);
        Self {
            period_ms: AtomicU64::new(period_ms),
        }
    }

    /// The process-wide configuration singleton, initialized from
    /// [`PERIOD_MS_ENV_VAR`] on first call.
    pub fn global() -> &'static CheckpointConfig {
        static CONFIG: OnceLock<CheckpointConfig> = OnceLock::new();
        CONFIG.get_or_init(CheckpointConfig::from_env)
    }

    /// The period a new checkpoint round should pace itself to, in
    /// milliseconds, floored at [`MIN_PERIOD_MS`].
    pub fn period_ms(&self) -> u64 {
        self.period_ms.load(Ordering::Relaxed).max(MIN_PERIOD_MS)
    }

    /// Sets the live checkpoint period. No lower bound is enforced here;
    /// [`CheckpointConfig::period_ms`] floors it at read time instead, so a
    /// management command can set any value and pacing still behaves.
    pub fn set_period_ms(&self, ms: u64) {
        self.period_ms.store(ms, Ordering::Relaxed);
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            period_ms: AtomicU64::new(DEFAULT_PERIOD_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_period_matches_constant() {
        let config = CheckpointConfig::default();
        assert_eq!(config.period_ms(), DEFAULT_PERIOD_MS);
    }

    #[test]
    fn set_period_ms_is_visible_to_period_ms() {
        let config = CheckpointConfig::default();
        config.set_period_ms(500);
        assert_eq!(config.period_ms(), 500);
    }

    #[test]
    fn period_ms_floors_at_min_period() {
        let config = CheckpointConfig::default();
        config.set_period_ms(1);
        // Asserted against the literal from spec rather than `MIN_PERIOD_MS`
        // itself, so a regression in the constant can't hide behind the test.
        assert_eq!(config.period_ms(), 100);
    }
}
