use serde::{Deserialize, Serialize};

pub const DEFAULT_AUTO_APPROVE_THRESHOLD: f64 = 0.8;
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 60_000;

fn default_threshold() -> f64 {
    DEFAULT_AUTO_APPROVE_THRESHOLD
}

fn default_step_timeout_ms() -> u64 {
    DEFAULT_STEP_TIMEOUT_MS
}

/// Engine-wide settings, read from the `engine` section of a catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum confidence for `low_confidence_review` attributes to auto-approve.
    #[serde(default = "default_threshold")]
    pub auto_approve_threshold: f64,
    /// Deadline applied to every processor step.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_approve_threshold: DEFAULT_AUTO_APPROVE_THRESHOLD,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.step_timeout_ms)
    }
}
