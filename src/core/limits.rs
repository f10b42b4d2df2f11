//! Generation limits and enforcement.
//!
//! A run is bounded by its scene count, by how many step calls it may make
//! (retries and repairs count) and by a wall-clock deadline. Revision and
//! continuity cadence live here too since they are tuned alongside.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied to every generation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationLimits {
    /// Critic/writer rounds per scene before revision exits anyway (default: 3)
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,

    /// Scenes between continuity passes (default: 1 = every scene)
    #[serde(default = "default_archivist_interval")]
    pub archivist_interval: u32,

    /// Upper bound for `totalScenes` (default: 200)
    #[serde(default = "default_max_scenes")]
    pub max_scenes: u32,

    /// Step calls per run, retries and repairs included (default: 2000)
    #[serde(default = "default_max_step_calls")]
    pub max_step_calls: u32,

    /// Largest accepted text of one artifact or draft (default: 1MB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,

    /// Per-call step timeout in seconds (default: 300)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Wall-clock budget of one run or resumption in seconds (default: 4h)
    #[serde(default = "default_run_deadline")]
    pub run_deadline_seconds: u64,
}

fn default_max_revisions() -> u32 {
    3
}
fn default_archivist_interval() -> u32 {
    1
}
fn default_max_scenes() -> u32 {
    200
}
fn default_max_step_calls() -> u32 {
    2000
}
fn default_max_output_bytes() -> u64 {
    1024 * 1024
}
fn default_step_timeout() -> u64 {
    300
}
fn default_run_deadline() -> u64 {
    4 * 3600
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_revisions: default_max_revisions(),
            archivist_interval: default_archivist_interval(),
            max_scenes: default_max_scenes(),
            max_step_calls: default_max_step_calls(),
            max_output_bytes: default_max_output_bytes(),
            step_timeout_seconds: default_step_timeout(),
            run_deadline_seconds: default_run_deadline(),
        }
    }
}

impl GenerationLimits {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    /// Reject scene counts outside `1..=max_scenes`
    pub fn validate_request(&self, total_scenes: u32) -> Result<(), LimitViolation> {
        if total_scenes == 0 || total_scenes > self.max_scenes {
            return Err(LimitViolation::SceneCount {
                requested: total_scenes,
                limit: self.max_scenes,
            });
        }
        Ok(())
    }

    pub fn validate_output(&self, text: &str) -> Result<(), LimitViolation> {
        let bytes = text.len() as u64;
        if bytes > self.max_output_bytes {
            return Err(LimitViolation::OutputTooLarge {
                bytes,
                limit: self.max_output_bytes,
            });
        }
        Ok(())
    }

    /// Whether the continuity engine runs for `scene`
    pub fn continuity_due(&self, scene: u32, last_archivist_scene: u32, total_scenes: u32) -> bool {
        scene >= total_scenes || scene.saturating_sub(last_archivist_scene) >= self.archivist_interval.max(1)
    }

    /// Called before every phase and every step call
    pub fn check(&self, usage: &LimitTracker) -> Result<(), LimitViolation> {
        if usage.step_calls >= self.max_step_calls {
            return Err(LimitViolation::StepCallBudget {
                calls: usage.step_calls,
                limit: self.max_step_calls,
            });
        }

        let elapsed = usage.elapsed_seconds();
        if elapsed >= self.run_deadline_seconds {
            return Err(LimitViolation::DeadlinePassed {
                elapsed_seconds: elapsed,
                limit_seconds: self.run_deadline_seconds,
            });
        }

        Ok(())
    }
}

/// Step usage of one run (reset when a run is resumed)
#[derive(Debug, Clone)]
pub struct LimitTracker {
    pub step_calls: u32,
    /// Bytes of raw step output received
    pub bytes_received: u64,
    pub started_at: Instant,
}

impl Default for LimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LimitTracker {
    pub fn new() -> Self {
        Self {
            step_calls: 0,
            bytes_received: 0,
            started_at: Instant::now(),
        }
    }

    /// Count one step call, failed calls with zero bytes
    pub fn record_call(&mut self, bytes: u64) {
        self.step_calls += 1;
        self.bytes_received += bytes;
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[derive(Debug, Clone, Error)]
pub enum LimitViolation {
    #[error("Step call budget spent: {calls} of {limit}")]
    StepCallBudget { calls: u32, limit: u32 },

    #[error("Output of {bytes} bytes exceeds the {limit} byte limit")]
    OutputTooLarge { bytes: u64, limit: u64 },

    #[error("Run deadline passed after {elapsed_seconds}s (limit {limit_seconds}s)")]
    DeadlinePassed {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },

    #[error("Scene count {requested} outside 1..={limit}")]
    SceneCount { requested: u32, limit: u32 },
}
