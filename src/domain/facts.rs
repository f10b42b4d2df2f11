//! Raw facts and key constraints.
//!
//! Steps emit raw facts: unresolved observations that may contradict each
//! other. The continuity engine turns them into key constraints, the
//! canonical facts later steps must respect.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The agents that take part in a generation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    /// Premise and overall shape of the story
    Architect,
    /// Character profiles
    Profiler,
    /// Setting, locations, organizations
    Worldbuilder,
    /// Scene-by-scene outline
    Strategist,
    /// Scene drafts
    Writer,
    /// Draft review
    Critic,
    /// Continuity bookkeeping
    Archivist,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Architect => "architect",
            StepName::Profiler => "profiler",
            StepName::Worldbuilder => "worldbuilder",
            StepName::Strategist => "strategist",
            StepName::Writer => "writer",
            StepName::Critic => "critic",
            StepName::Archivist => "archivist",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unresolved observation emitted by a step. Never mutated once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFact {
    /// Identifier used to report discards
    pub id: Uuid,

    /// Free-text observation, e.g. "Elena has green eyes"
    pub fact: String,

    /// Step that produced the fact
    pub source: StepName,

    /// Scene the fact was observed in
    pub scene_number: u32,

    /// When the fact was recorded
    pub timestamp: DateTime<Utc>,
}

impl RawFact {
    pub fn new(fact: impl Into<String>, source: StepName, scene_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            fact: fact.into(),
            source,
            scene_number,
            timestamp: Utc::now(),
        }
    }

    /// Override the timestamp (replays and tests)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A canonical, semantically keyed fact.
///
/// Keys look like `Subject.attribute`. For any key only the constraint with
/// the greatest timestamp is canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyConstraint {
    pub key: String,
    pub value: String,
    pub source: StepName,
    pub scene_number: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl KeyConstraint {
    /// The subject part of the key (`Elena` in `Elena.eyes`)
    pub fn subject(&self) -> &str {
        self.key.split_once('.').map(|(s, _)| s).unwrap_or(&self.key)
    }

    /// The attribute part of the key (`eyes` in `Elena.eyes`)
    pub fn attribute(&self) -> Option<&str> {
        self.key.split_once('.').map(|(_, a)| a)
    }
}

/// Why a raw fact did not become (or stay) canonical
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// A newer observation for the same key won
    Superseded,
    /// The fact maps to no tracked key or event
    Irrelevant,
}

/// Traceability record for a fact excluded from resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscardedFact {
    pub fact_id: Uuid,
    pub reason: DiscardReason,
    /// Key the fact competed for, when it had one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Merge two constraint sets, keeping the newest constraint per key.
///
/// On equal timestamps the incoming constraint wins only if it comes from a
/// later scene. Output is sorted by key.
pub fn resolve_constraints(
    existing: &[KeyConstraint],
    incoming: &[KeyConstraint],
) -> Vec<KeyConstraint> {
    let mut by_key: BTreeMap<&str, &KeyConstraint> = BTreeMap::new();

    for constraint in existing.iter().chain(incoming) {
        match by_key.get(constraint.key.as_str()) {
            Some(current) if !supersedes(constraint, current) => {}
            _ => {
                by_key.insert(&constraint.key, constraint);
            }
        }
    }

    by_key.into_values().cloned().collect()
}

fn supersedes(candidate: &KeyConstraint, current: &KeyConstraint) -> bool {
    (candidate.timestamp, candidate.scene_number) > (current.timestamp, current.scene_number)
}
