//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DeclError, DeclResult};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum reconciliation passes per run before the engine force-settles.
    pub max_passes: usize,
    /// Whether root-level selector queries may return the watched root.
    pub include_root: bool,
    /// Max queued faults before new ones are dropped.
    pub fault_capacity: usize,
    /// Delay used by the timer fallback scheduler, in milliseconds.
    pub fallback_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_passes: 64,
            include_root: true,
            fault_capacity: 256,
            fallback_interval_ms: 16,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON object; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> DeclResult<Self> {
        let cfg: Self =
            serde_json::from_str(json).map_err(|e| DeclError::config(format!("invalid engine config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> DeclResult<()> {
        if self.max_passes == 0 {
            return Err(DeclError::config("max_passes must be at least 1"));
        }
        if self.fault_capacity == 0 {
            return Err(DeclError::config("fault_capacity must be at least 1"));
        }
        Ok(())
    }

    /// The timer fallback delay.
    #[must_use]
    pub const fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }
}
