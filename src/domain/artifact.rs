//! Artifacts produced by generation phases.
//!
//! Phase outputs are the inputs of later phases: a phase may only begin
//! once the artifacts it requires exist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::facts::StepName;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Name declared by the producing phase, e.g. "outline"
    pub name: String,
    pub produced_by: StepName,
    pub kind: ArtifactKind,
    pub content: String,
    pub produced_at: DateTime<Utc>,
    pub bytes: u64,
}

impl Artifact {
    pub fn new(
        name: impl Into<String>,
        produced_by: StepName,
        kind: ArtifactKind,
        content: String,
    ) -> Self {
        Self {
            name: name.into(),
            produced_by,
            kind,
            bytes: content.len() as u64,
            content,
            produced_at: Utc::now(),
        }
    }

    /// Output of a run-level or continuity phase
    pub fn from_output(name: impl Into<String>, produced_by: StepName, content: String) -> Self {
        Self::new(name, produced_by, ArtifactKind::PhaseOutput, content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Premise, characters, world, outline, continuity report
    PhaseOutput,
    /// Scene text, first draft or a revision of it
    Draft,
    /// Serialized generation state written on interruption
    RunStateSnapshot,
}

impl ArtifactKind {
    /// File stem used when the artifact is written to disk
    pub fn file_stem(&self) -> &'static str {
        match self {
            ArtifactKind::PhaseOutput => "phase_output",
            ArtifactKind::Draft => "draft",
            ArtifactKind::RunStateSnapshot => "run_state_snapshot",
        }
    }
}
