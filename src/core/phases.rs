//! Phase registry.
//!
//! A run walks the phases in table order. Run-level phases execute once;
//! per-scene phases repeat for every scene. Each phase names its primary
//! step, its supporting steps, the artifact it produces and the artifacts
//! that must exist before it may begin.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{GenerationState, PhaseName, StepName};

/// Static description of one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSpec {
    pub name: PhaseName,
    pub primary: StepName,
    pub supporting: &'static [StepName],
    /// Name of the artifact the phase produces
    pub artifact: &'static str,
    /// Artifacts that must exist before the phase begins
    pub requires: &'static [&'static str],
    /// Whether the phase repeats for every scene
    pub per_scene: bool,
}

/// All phases in execution order
pub const PHASES: [PhaseSpec; 7] = [
    PhaseSpec {
        name: PhaseName::Premise,
        primary: StepName::Architect,
        supporting: &[],
        artifact: "premise",
        requires: &[],
        per_scene: false,
    },
    PhaseSpec {
        name: PhaseName::Characters,
        primary: StepName::Profiler,
        supporting: &[StepName::Architect],
        artifact: "characters",
        requires: &["premise"],
        per_scene: false,
    },
    PhaseSpec {
        name: PhaseName::WorldBuilding,
        primary: StepName::Worldbuilder,
        supporting: &[StepName::Architect],
        artifact: "world",
        requires: &["premise"],
        per_scene: false,
    },
    PhaseSpec {
        name: PhaseName::Outline,
        primary: StepName::Strategist,
        supporting: &[StepName::Architect],
        artifact: "outline",
        requires: &["characters", "world"],
        per_scene: false,
    },
    PhaseSpec {
        name: PhaseName::Drafting,
        primary: StepName::Writer,
        supporting: &[],
        artifact: "draft",
        requires: &["outline"],
        per_scene: true,
    },
    PhaseSpec {
        name: PhaseName::Revision,
        primary: StepName::Critic,
        supporting: &[StepName::Writer],
        artifact: "revised_draft",
        requires: &["draft"],
        per_scene: true,
    },
    PhaseSpec {
        name: PhaseName::Continuity,
        primary: StepName::Archivist,
        supporting: &[],
        artifact: "continuity_report",
        requires: &["draft"],
        per_scene: true,
    },
];

impl PhaseSpec {
    /// Key under which the phase output is stored in `GenerationState::artifacts`.
    /// Per-scene outputs are kept per scene.
    pub fn artifact_key(&self, scene: u32) -> String {
        if self.per_scene {
            format!("scene-{}/{}", scene, self.artifact)
        } else {
            self.artifact.to_string()
        }
    }

    /// Every step the phase may invoke
    pub fn steps(&self) -> impl Iterator<Item = StepName> + '_ {
        std::iter::once(self.primary).chain(self.supporting.iter().copied())
    }
}

/// Look up a phase
pub fn spec(phase: PhaseName) -> &'static PhaseSpec {
    // PHASES covers every PhaseName in declaration order
    &PHASES[phase as usize]
}

/// The phase after `phase`, or `None` after the last one
pub fn next(phase: PhaseName) -> Option<PhaseName> {
    PHASES.get(phase as usize + 1).map(|p| p.name)
}

/// Required artifacts of `phase` that `state` does not have yet
pub fn missing_artifacts(phase: PhaseName, state: &GenerationState) -> Vec<&'static str> {
    spec(phase)
        .requires
        .iter()
        .copied()
        .filter(|name| !state.has_artifact(name))
        .collect()
}

/// The checkpoint after `(scene, phase)`: the next phase in the same scene,
/// the first per-scene phase of the next scene, or `None` when the run is done.
pub fn advance(scene: u32, phase: PhaseName, total_scenes: u32) -> Option<(u32, PhaseName)> {
    match next(phase) {
        Some(next_phase) => Some((scene, next_phase)),
        None if scene < total_scenes => {
            let first_scene_phase = PHASES.iter().find(|p| p.per_scene)?.name;
            Some((scene + 1, first_scene_phase))
        }
        None => None,
    }
}

/// Retry policy for step calls that fail outright (process error, timeout).
/// Outputs that decode but fail validation go through repair instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Calls per step, the first one included (default: 3)
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Wait before the first retry in milliseconds (default: 2000)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Ceiling for the doubling wait in milliseconds (default: 20000)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    2000
}
fn default_max_delay() -> u64 {
    20_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed call number `attempt` (1-indexed); doubles per call
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << doublings);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_table_matches_phase_order() {
        for (index, phase) in PHASES.iter().enumerate() {
            assert_eq!(phase.name as usize, index);
            assert_eq!(spec(phase.name).name, phase.name);
        }
        assert_eq!(PHASES[0].name, PhaseName::Premise);
    }

    #[test]
    fn test_next_phase() {
        assert_eq!(next(PhaseName::Premise), Some(PhaseName::Characters));
        assert_eq!(next(PhaseName::Outline), Some(PhaseName::Drafting));
        assert_eq!(next(PhaseName::Continuity), None);
    }

    #[test]
    fn test_advance_loops_over_scenes() {
        assert_eq!(
            advance(1, PhaseName::Outline, 2),
            Some((1, PhaseName::Drafting))
        );
        assert_eq!(
            advance(1, PhaseName::Continuity, 2),
            Some((2, PhaseName::Drafting))
        );
        assert_eq!(advance(2, PhaseName::Continuity, 2), None);
    }

    #[test]
    fn test_requirements_gate_phase_start() {
        let mut state = GenerationState::new(Uuid::new_v4(), "p", 1);
        assert_eq!(
            missing_artifacts(PhaseName::Outline, &state),
            vec!["characters", "world"]
        );

        state.artifacts.insert(
            "characters".to_string(),
            crate::domain::Artifact::from_output("characters", StepName::Profiler, "x".into()),
        );
        assert_eq!(missing_artifacts(PhaseName::Outline, &state), vec!["world"]);

        // Draft requirement is per scene
        assert_eq!(missing_artifacts(PhaseName::Revision, &state), vec!["draft"]);
        state.record_draft(1, "Once.".to_string());
        assert!(missing_artifacts(PhaseName::Revision, &state).is_empty());
    }

    #[test]
    fn test_per_scene_artifact_keys() {
        assert_eq!(spec(PhaseName::Outline).artifact_key(3), "outline");
        assert_eq!(
            spec(PhaseName::Continuity).artifact_key(3),
            "scene-3/continuity_report"
        );
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy {
            base_delay_ms: 500,
            max_delay_ms: 3000,
            ..Default::default()
        };

        let waits: Vec<u64> = (1..=5)
            .map(|attempt| policy.backoff(attempt).as_millis() as u64)
            .collect();
        assert_eq!(waits, vec![500, 1000, 2000, 3000, 3000]);
        assert_eq!(policy.backoff(200), Duration::from_millis(3000));

        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));
    }
}
