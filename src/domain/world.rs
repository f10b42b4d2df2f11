//! Canonical world state and the diffs that update it.
//!
//! The world state is the aggregate of everything the story has established
//! about characters, places and events. It only changes through
//! [`WorldState::apply_diff`], which is an idempotent upsert by name.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Life status of a character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterStatus {
    Alive,
    Dead,
    Unknown,
    Transformed,
}

impl Default for CharacterStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

const DEAD_TERMS: &[&str] = &[
    "dead", "deceased", "died", "dies", "killed", "slain", "murdered", "perished", "executed",
    "fallen",
];
const TRANSFORMED_TERMS: &[&str] = &[
    "transformed", "turned", "cursed", "possessed", "undead", "ascended", "mutated", "changed",
    "reborn",
];
const ALIVE_TERMS: &[&str] = &[
    "alive", "living", "healthy", "survived", "survives", "recovered", "injured", "wounded",
    "well",
];

impl CharacterStatus {
    /// Map free-text status from a step onto the closed set.
    ///
    /// Matching is per word, so "undead" never reads as "dead". Anything
    /// unrecognized is `Unknown`.
    pub fn normalize(raw: &str) -> Self {
        let lowered = raw.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let has = |terms: &[&str]| words.iter().any(|w| terms.contains(w));

        if has(DEAD_TERMS) {
            Self::Dead
        } else if has(TRANSFORMED_TERMS) {
            Self::Transformed
        } else if has(ALIVE_TERMS) {
            Self::Alive
        } else {
            Self::Unknown
        }
    }
}

/// How much an event matters to the story
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    Major,
    Minor,
    Background,
}

const MAJOR_TERMS: &[&str] = &[
    "major", "critical", "crucial", "pivotal", "climactic", "climax", "decisive", "momentous",
    "catastrophic", "vital", "significant", "important", "turning",
];
const MINOR_TERMS: &[&str] = &["minor", "slight", "slightly", "small", "subtle", "brief", "trivial"];
const BACKGROUND_TERMS: &[&str] = &[
    "background", "ambient", "routine", "incidental", "flavor", "flavour", "passing", "mention",
];
const MINOR_GUARDS: &[&str] = &["minor", "slight", "small"];

impl Significance {
    /// Classify free text by keyword votes.
    ///
    /// Ties and texts without any keyword fall back to `Minor`. Text that
    /// contains "minor", "slight" or "small" anywhere is never `Major`.
    pub fn classify(raw: &str) -> Self {
        let lowered = raw.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let count = |terms: &[&str]| words.iter().filter(|w| terms.contains(w)).count();

        let guarded = MINOR_GUARDS.iter().any(|g| lowered.contains(g));
        let major = if guarded { 0 } else { count(MAJOR_TERMS) };
        let minor = count(MINOR_TERMS);
        let background = count(BACKGROUND_TERMS);

        if major > minor && major > background {
            Self::Major
        } else if background > major && background > minor {
            Self::Background
        } else {
            Self::Minor
        }
    }
}

/// What the story has established about one character
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterState {
    /// Unique per run
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub role: String,
    pub status: CharacterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub relationships: BTreeMap<String, String>,
    pub last_seen_scene: u32,
}

impl CharacterState {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            role: role.into(),
            status: CharacterStatus::Unknown,
            current_location: None,
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
            last_seen_scene: 0,
        }
    }

    /// Case-insensitive match on name or alias
    pub fn answers_to(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationState {
    /// Unique per run
    pub name: String,
    #[serde(rename = "type")]
    pub location_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: String,
    pub last_mentioned_scene: u32,
}

impl LocationState {
    pub fn new(name: impl Into<String>, scene: u32) -> Self {
        Self {
            name: name.into(),
            location_type: "unspecified".to_string(),
            description: None,
            status: "intact".to_string(),
            last_mentioned_scene: scene,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationState {
    /// Unique per run
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub last_mentioned_scene: u32,
}

/// An event placed on the story timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineFact {
    pub event: String,
    pub scene_number: u32,
    pub significance: Significance,
    pub timestamp: DateTime<Utc>,
}

/// Canonical aggregate of a run's established facts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldState {
    pub run_id: Uuid,
    /// Never decreases
    pub last_updated_scene: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub characters: Vec<CharacterState>,
    #[serde(default)]
    pub locations: Vec<LocationState>,
    #[serde(default)]
    pub organizations: Vec<OrganizationState>,
    #[serde(default)]
    pub timeline: Vec<TimelineFact>,
    #[serde(default)]
    pub key_facts: Vec<String>,
}

impl WorldState {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            last_updated_scene: 0,
            last_updated_at: None,
            characters: Vec::new(),
            locations: Vec::new(),
            organizations: Vec::new(),
            timeline: Vec::new(),
            key_facts: Vec::new(),
        }
    }

    pub fn character(&self, name: &str) -> Option<&CharacterState> {
        self.characters.iter().find(|c| c.answers_to(name))
    }

    pub fn location(&self, name: &str) -> Option<&LocationState> {
        self.locations
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name))
    }

    /// Merge a diff produced at `diff.scene`.
    ///
    /// Upsert by name everywhere, so applying the same diff twice leaves the
    /// state as after the first application.
    pub fn apply_diff(&mut self, diff: &WorldStateDiff) {
        for update in &diff.character_updates {
            self.upsert_character(update, diff.scene);
        }

        for location in &diff.new_locations {
            if self.location(&location.name).is_none() {
                self.locations.push(location.clone());
            }
        }

        for org in &diff.organizations {
            match self
                .organizations
                .iter_mut()
                .find(|o| o.name.eq_ignore_ascii_case(&org.name))
            {
                Some(existing) => {
                    if org.description.is_some() {
                        existing.description = org.description.clone();
                    }
                    existing.last_mentioned_scene =
                        existing.last_mentioned_scene.max(org.last_mentioned_scene);
                }
                None => self.organizations.push(org.clone()),
            }
        }

        for event in &diff.timeline_events {
            let known = self
                .timeline
                .iter()
                .any(|t| t.event == event.event && t.scene_number == event.scene_number);
            if !known {
                self.timeline.push(event.clone());
            }
        }

        for fact in &diff.key_facts {
            if !self.key_facts.contains(fact) {
                self.key_facts.push(fact.clone());
            }
        }

        self.last_updated_scene = self.last_updated_scene.max(diff.scene);
        self.last_updated_at = match self.last_updated_at {
            Some(at) if at >= diff.generated_at => Some(at),
            _ => Some(diff.generated_at),
        };
    }

    fn upsert_character(&mut self, update: &CharacterUpdate, scene: u32) {
        let index = match self.characters.iter().position(|c| c.answers_to(&update.name)) {
            Some(index) => index,
            None => {
                let role = update.role.clone().unwrap_or_else(|| "unknown".to_string());
                self.characters.push(CharacterState::new(update.name.clone(), role));
                self.characters.len() - 1
            }
        };
        let character = &mut self.characters[index];

        if let Some(role) = &update.role {
            character.role = role.clone();
        }
        if let Some(status) = update.status {
            character.status = status;
        }
        if let Some(location) = &update.current_location {
            character.current_location = Some(location.clone());
        }
        // Shallow overwrite per key
        for (key, value) in &update.attributes {
            character.attributes.insert(key.clone(), value.clone());
        }
        for (other, relation) in &update.relationships {
            character.relationships.insert(other.clone(), relation.clone());
        }
        for alias in &update.aliases {
            if !character.answers_to(alias) {
                character.aliases.push(alias.clone());
            }
        }
        character.last_seen_scene = character.last_seen_scene.max(scene);
    }
}

/// Changes to one character. `None` / empty fields leave the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterUpdate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CharacterStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl CharacterUpdate {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// World-state changes produced by one continuity pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldStateDiff {
    /// Scene that triggered the merge
    pub scene: u32,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub character_updates: Vec<CharacterUpdate>,
    #[serde(default)]
    pub new_locations: Vec<LocationState>,
    #[serde(default)]
    pub organizations: Vec<OrganizationState>,
    #[serde(default)]
    pub timeline_events: Vec<TimelineFact>,
    #[serde(default)]
    pub key_facts: Vec<String>,
}

impl WorldStateDiff {
    pub fn empty(scene: u32) -> Self {
        Self {
            scene,
            generated_at: Utc::now(),
            character_updates: Vec::new(),
            new_locations: Vec::new(),
            organizations: Vec::new(),
            timeline_events: Vec::new(),
            key_facts: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.character_updates.is_empty()
            && self.new_locations.is_empty()
            && self.organizations.is_empty()
            && self.timeline_events.is_empty()
            && self.key_facts.is_empty()
    }
}
