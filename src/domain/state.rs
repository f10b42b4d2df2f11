//! Generation state owned by a run's single active writer.
//!
//! Created when a run starts, mutated only by phase transitions and
//! continuity merges, snapshotted on interruption and discarded when the
//! run completes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::Artifact;
use super::facts::{DiscardedFact, KeyConstraint, RawFact};
use super::world::WorldState;

/// Named stages of a run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Premise,
    Characters,
    WorldBuilding,
    Outline,
    Drafting,
    Revision,
    Continuity,
}

impl PhaseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Premise => "premise",
            PhaseName::Characters => "characters",
            PhaseName::WorldBuilding => "world_building",
            PhaseName::Outline => "outline",
            PhaseName::Drafting => "drafting",
            PhaseName::Revision => "revision",
            PhaseName::Continuity => "continuity",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One review of a scene draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Critique {
    pub approved: bool,
    #[serde(default)]
    pub notes: Vec<String>,
    /// Revision iteration the review belongs to (1-based)
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
}

/// Full state of one generation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationState {
    pub run_id: Uuid,
    pub project_id: String,
    pub phase: PhaseName,
    /// Scene being worked on (1-based)
    pub current_scene: u32,
    pub total_scenes: u32,
    #[serde(default)]
    pub drafts: BTreeMap<u32, String>,
    #[serde(default)]
    pub critiques: BTreeMap<u32, Vec<Critique>>,
    #[serde(default)]
    pub revision_count: BTreeMap<u32, u32>,
    #[serde(default)]
    pub key_constraints: Vec<KeyConstraint>,
    #[serde(default)]
    pub raw_facts_log: Vec<RawFact>,
    #[serde(default)]
    pub last_archivist_scene: u32,
    /// Facts already reported as discarded by a continuity pass
    #[serde(default)]
    pub reported_discards: BTreeSet<Uuid>,
    pub world_state: WorldState,
    /// Run-level phase outputs keyed by artifact name
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationState {
    pub fn new(run_id: Uuid, project_id: impl Into<String>, total_scenes: u32) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            project_id: project_id.into(),
            phase: PhaseName::Premise,
            current_scene: 1,
            total_scenes,
            drafts: BTreeMap::new(),
            critiques: BTreeMap::new(),
            revision_count: BTreeMap::new(),
            key_constraints: Vec::new(),
            raw_facts_log: Vec::new(),
            last_archivist_scene: 0,
            reported_discards: BTreeSet::new(),
            world_state: WorldState::new(run_id),
            artifacts: BTreeMap::new(),
            is_paused: false,
            is_completed: false,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether an artifact exists. Drafts are per scene and live in `drafts`.
    pub fn has_artifact(&self, name: &str) -> bool {
        match name {
            "draft" => self.drafts.contains_key(&self.current_scene),
            _ => self.artifacts.contains_key(name),
        }
    }

    /// Append facts to the raw-fact log
    pub fn record_facts(&mut self, facts: impl IntoIterator<Item = RawFact>) -> usize {
        let before = self.raw_facts_log.len();
        self.raw_facts_log.extend(facts);
        self.touch();
        self.raw_facts_log.len() - before
    }

    /// Facts observed up to and including `scene`
    pub fn facts_up_to(&self, scene: u32) -> Vec<RawFact> {
        self.raw_facts_log
            .iter()
            .filter(|f| f.scene_number <= scene)
            .cloned()
            .collect()
    }

    /// Discards no earlier pass has reported, marking them reported
    pub fn take_new_discards(&mut self, discarded: &[DiscardedFact]) -> Vec<DiscardedFact> {
        discarded
            .iter()
            .filter(|d| self.reported_discards.insert(d.fact_id))
            .cloned()
            .collect()
    }

    pub fn record_draft(&mut self, scene: u32, content: String) {
        self.drafts.insert(scene, content);
        self.touch();
    }

    pub fn record_critique(&mut self, scene: u32, critique: Critique) {
        self.critiques.entry(scene).or_default().push(critique);
        self.touch();
    }

    /// Increment and return the revision count of a scene
    pub fn bump_revision(&mut self, scene: u32) -> u32 {
        let count = self.revision_count.entry(scene).or_insert(0);
        *count += 1;
        *count
    }

    pub fn mark_completed(&mut self) {
        self.is_completed = true;
        self.is_paused = false;
        self.touch();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.touch();
    }

    /// Progress of the run as (scene, phase), ordered for checkpoint comparison
    pub fn checkpoint(&self) -> (u32, PhaseName) {
        (self.current_scene, self.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::facts::StepName;

    #[test]
    fn test_state_creation() {
        let run_id = Uuid::new_v4();
        let state = GenerationState::new(run_id, "project-1", 5);

        assert_eq!(state.run_id, run_id);
        assert_eq!(state.world_state.run_id, run_id);
        assert_eq!(state.phase, PhaseName::Premise);
        assert_eq!(state.current_scene, 1);
        assert!(!state.is_completed);
    }

    #[test]
    fn test_facts_up_to_scene() {
        let mut state = GenerationState::new(Uuid::new_v4(), "p", 3);
        state.record_facts(vec![
            RawFact::new("Elena has blue eyes", StepName::Writer, 1),
            RawFact::new("Elena has green eyes", StepName::Writer, 3),
        ]);

        assert_eq!(state.facts_up_to(2).len(), 1);
        assert_eq!(state.facts_up_to(3).len(), 2);
    }

    #[test]
    fn test_discards_are_reported_once() {
        use crate::domain::facts::DiscardReason;

        let mut state = GenerationState::new(Uuid::new_v4(), "p", 3);
        let old = DiscardedFact {
            fact_id: Uuid::new_v4(),
            reason: DiscardReason::Irrelevant,
            key: None,
        };
        let new = DiscardedFact {
            fact_id: Uuid::new_v4(),
            reason: DiscardReason::Superseded,
            key: Some("Elena.eyes".to_string()),
        };

        assert_eq!(state.take_new_discards(std::slice::from_ref(&old)), vec![old.clone()]);
        assert_eq!(state.take_new_discards(&[old.clone(), new.clone()]), vec![new]);
        assert!(state.take_new_discards(&[old]).is_empty());
    }

    #[test]
    fn test_revision_counter() {
        let mut state = GenerationState::new(Uuid::new_v4(), "p", 3);
        assert_eq!(state.bump_revision(2), 1);
        assert_eq!(state.bump_revision(2), 2);
        assert_eq!(state.revision_count.get(&1), None);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = GenerationState::new(Uuid::new_v4(), "p", 2);
        state.record_draft(1, "It was raining.".to_string());
        state.phase = PhaseName::Revision;

        let json = serde_json::to_string(&state).unwrap();
        let parsed: GenerationState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_checkpoint_ordering() {
        let mut state = GenerationState::new(Uuid::new_v4(), "p", 4);
        let before = state.checkpoint();
        state.phase = PhaseName::Drafting;
        state.current_scene = 2;
        assert!(state.checkpoint() > before);
    }
}
