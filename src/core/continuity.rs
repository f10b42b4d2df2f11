//! Continuity engine.
//!
//! Turns the raw-fact log into canonical key constraints and a world-state
//! diff. For every key the observation with the greatest timestamp wins
//! (ties: later scene, then later log position; an existing constraint
//! wins a full tie). Everything that loses, or that maps to nothing the
//! engine tracks, is reported as discarded with a reason.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::domain::{
    resolve_constraints, CharacterStatus, CharacterUpdate, DiscardReason, DiscardedFact,
    KeyConstraint, LocationState, OrganizationState, RawFact, Significance, TimelineFact,
    WorldState, WorldStateDiff,
};

/// What a raw fact says, once interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// A value for `Subject.attribute`
    Keyed {
        subject: String,
        attribute: String,
        value: String,
    },
    /// Something that happened
    Event {
        text: String,
        significance: Significance,
    },
    Irrelevant,
}

impl Observation {
    fn keyed(subject: &str, attribute: &str, value: &str) -> Self {
        let subject = subject.trim();
        let attribute = attribute.trim().to_lowercase().replace(' ', "_");
        let value = value.trim();
        if subject.is_empty() || attribute.is_empty() || value.is_empty() {
            return Observation::Irrelevant;
        }
        Observation::Keyed {
            subject: subject.to_string(),
            attribute,
            value: value.to_string(),
        }
    }
}

/// Maps free-text facts onto observations
pub trait FactInterpreter: Send + Sync {
    fn interpret(&self, fact: &str) -> Observation;
}

/// Default fact grammar:
///
/// - `Subject.attr = value` or `Subject.attr: value`
/// - `Subject has <value> <attr>` (`Elena has blue eyes`)
/// - `Subject is at|in <Place>` (location)
/// - `Subject is <status word>`, `Subject died`, `Subject was killed` (status)
/// - `[<significance>] event: text` or `event: text` (timeline)
///
/// Sentence forms need a capitalized subject.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternInterpreter;

const ARTICLES: &[&str] = &["a", "an", "the"];

impl PatternInterpreter {
    fn event(fact: &str) -> Option<Observation> {
        let (tag, rest) = match fact.strip_prefix('[') {
            Some(tagged) => {
                let (tag, rest) = tagged.split_once(']')?;
                (Some(tag.trim()), rest.trim())
            }
            None => (None, fact),
        };

        let body = match rest.get(..6) {
            Some(prefix) if prefix.eq_ignore_ascii_case("event:") => rest[6..].trim(),
            _ if tag.is_some() => rest,
            _ => return None,
        };
        if body.is_empty() {
            return Some(Observation::Irrelevant);
        }

        let significance = Significance::classify(tag.unwrap_or(body));
        Some(Observation::Event {
            text: body.to_string(),
            significance,
        })
    }

    fn assignment(fact: &str) -> Option<Observation> {
        let split_at = fact.find(['=', ':'])?;
        let (lhs, rhs) = (&fact[..split_at], &fact[split_at + 1..]);
        let (subject, attribute) = lhs.trim().rsplit_once('.')?;
        if attribute.trim().contains(char::is_whitespace) {
            return None;
        }
        Some(Observation::keyed(subject, attribute, rhs))
    }

    fn sentence(fact: &str) -> Option<Observation> {
        let starts_capitalized = fact.chars().next().is_some_and(char::is_uppercase);
        if !starts_capitalized {
            return None;
        }

        for marker in [" was killed", " died"] {
            if let Some(index) = fact.find(marker) {
                let subject = &fact[..index];
                return Some(Observation::keyed(subject, "status", "dead"));
            }
        }

        for marker in [" is at ", " is in "] {
            if let Some((subject, place)) = fact.split_once(marker) {
                return Some(Observation::keyed(subject, "location", place));
            }
        }

        if let Some((subject, rest)) = fact.split_once(" has ") {
            let words: Vec<&str> = rest
                .split_whitespace()
                .skip_while(|w| ARTICLES.contains(&w.to_lowercase().as_str()))
                .collect();
            return Some(match words.split_last() {
                Some((attribute, [])) => Observation::keyed(subject, attribute, "present"),
                Some((attribute, value)) => Observation::keyed(subject, attribute, &value.join(" ")),
                None => Observation::Irrelevant,
            });
        }

        if let Some((subject, rest)) = fact.split_once(" is ") {
            if CharacterStatus::normalize(rest) != CharacterStatus::Unknown {
                return Some(Observation::keyed(subject, "status", rest));
            }
        }

        None
    }
}

impl FactInterpreter for PatternInterpreter {
    fn interpret(&self, fact: &str) -> Observation {
        let fact = fact.trim().trim_end_matches('.').trim();
        if fact.is_empty() {
            return Observation::Irrelevant;
        }

        Self::event(fact)
            .or_else(|| Self::assignment(fact))
            .or_else(|| Self::sentence(fact))
            .unwrap_or(Observation::Irrelevant)
    }
}

/// Result of one continuity pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuityOutcome {
    /// Scene that triggered the pass
    pub scene: u32,
    /// Complete canonical constraint set, sorted by key
    pub constraints: Vec<KeyConstraint>,
    /// Keys whose canonical value changed in this pass
    pub updated_keys: Vec<String>,
    pub diff: WorldStateDiff,
    pub discarded: Vec<DiscardedFact>,
}

struct Candidate<'a> {
    position: usize,
    fact: &'a RawFact,
    subject: String,
    attribute: String,
    value: String,
}

impl Candidate<'_> {
    fn rank(&self) -> (chrono::DateTime<Utc>, u32, usize) {
        (self.fact.timestamp, self.fact.scene_number, self.position)
    }
}

/// Resolves raw facts against constraints and world state
#[derive(Clone)]
pub struct ContinuityEngine {
    interpreter: Arc<dyn FactInterpreter>,
}

impl Default for ContinuityEngine {
    fn default() -> Self {
        Self::new(Arc::new(PatternInterpreter))
    }
}

impl ContinuityEngine {
    pub fn new(interpreter: Arc<dyn FactInterpreter>) -> Self {
        Self { interpreter }
    }

    /// Resolve facts observed up to and including `scene`.
    ///
    /// `facts` must be in log order; later facts break ties.
    pub fn resolve(
        &self,
        facts: &[RawFact],
        existing: &[KeyConstraint],
        world: &WorldState,
        scene: u32,
    ) -> ContinuityOutcome {
        let mut candidates: BTreeMap<String, Vec<Candidate<'_>>> = BTreeMap::new();
        let mut events: Vec<TimelineFact> = Vec::new();
        let mut discarded = Vec::new();

        for (position, fact) in facts.iter().enumerate() {
            if fact.scene_number > scene {
                continue;
            }
            match self.interpreter.interpret(&fact.fact) {
                Observation::Keyed {
                    subject,
                    attribute,
                    value,
                } => {
                    let key = format!("{}.{}", subject, attribute);
                    candidates.entry(key).or_default().push(Candidate {
                        position,
                        fact,
                        subject,
                        attribute,
                        value,
                    });
                }
                Observation::Event { text, significance } => {
                    let known = events
                        .iter()
                        .any(|e| e.event == text && e.scene_number == fact.scene_number);
                    if !known {
                        events.push(TimelineFact {
                            event: text,
                            scene_number: fact.scene_number,
                            significance,
                            timestamp: fact.timestamp,
                        });
                    }
                }
                Observation::Irrelevant => discarded.push(DiscardedFact {
                    fact_id: fact.id,
                    reason: DiscardReason::Irrelevant,
                    key: None,
                }),
            }
        }

        let existing_by_key: HashMap<&str, &KeyConstraint> =
            existing.iter().map(|c| (c.key.as_str(), c)).collect();

        let mut incoming = Vec::new();
        let mut winners: Vec<Candidate<'_>> = Vec::new();

        for (key, group) in candidates {
            let Some(best_index) = group
                .iter()
                .enumerate()
                .max_by_key(|(_, c)| c.rank())
                .map(|(i, _)| i)
            else {
                continue;
            };
            let best = &group[best_index];

            let current = existing_by_key.get(key.as_str()).copied();
            let existing_wins = current.is_some_and(|c| {
                (c.timestamp, c.scene_number) >= (best.fact.timestamp, best.fact.scene_number)
            });
            // The winning fact of an earlier pass is still the canonical source
            let best_is_canonical = current.is_some_and(|c| {
                c.timestamp == best.fact.timestamp
                    && c.scene_number == best.fact.scene_number
                    && c.value == best.value
            });

            for (index, candidate) in group.iter().enumerate() {
                let keeps = index == best_index && (!existing_wins || best_is_canonical);
                if !keeps {
                    discarded.push(DiscardedFact {
                        fact_id: candidate.fact.id,
                        reason: DiscardReason::Superseded,
                        key: Some(key.clone()),
                    });
                }
            }

            if !existing_wins {
                incoming.push(KeyConstraint {
                    key: key.clone(),
                    value: best.value.clone(),
                    source: best.fact.source,
                    scene_number: best.fact.scene_number,
                    timestamp: best.fact.timestamp,
                    reasoning: Some(format!(
                        "Newest of {} observation(s): \"{}\"",
                        group.len(),
                        best.fact.fact
                    )),
                });
                let mut group = group;
                winners.push(group.swap_remove(best_index));
            }
        }

        let constraints = resolve_constraints(existing, &incoming);
        let updated_keys = incoming.iter().map(|c| c.key.clone()).collect();
        let diff = build_diff(&winners, events, world, scene);

        ContinuityOutcome {
            scene,
            constraints,
            updated_keys,
            diff,
            discarded,
        }
    }
}

fn build_diff(
    winners: &[Candidate<'_>],
    events: Vec<TimelineFact>,
    world: &WorldState,
    scene: u32,
) -> WorldStateDiff {
    let mut diff = WorldStateDiff::empty(scene);

    // Locations first, so subjects naming a place are known before
    // character updates are built.
    for winner in winners.iter().filter(|w| w.attribute == "location") {
        let place = winner.value.as_str();
        let known = world.location(place).is_some()
            || diff
                .new_locations
                .iter()
                .any(|l| l.name.eq_ignore_ascii_case(place));
        if !known {
            diff.new_locations
                .push(LocationState::new(place, winner.fact.scene_number));
        }
    }

    let is_place = |name: &str, diff: &WorldStateDiff| {
        world.location(name).is_some()
            || diff
                .new_locations
                .iter()
                .any(|l| l.name.eq_ignore_ascii_case(name))
    };

    let mut updates: BTreeMap<String, CharacterUpdate> = BTreeMap::new();
    for winner in winners {
        if is_place(&winner.subject, &diff) {
            continue;
        }

        let name = world
            .character(&winner.subject)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| winner.subject.clone());
        let update = updates
            .entry(name.clone())
            .or_insert_with(|| CharacterUpdate::named(name));

        match winner.attribute.as_str() {
            "status" => update.status = Some(CharacterStatus::normalize(&winner.value)),
            "location" => update.current_location = Some(winner.value.clone()),
            "role" => update.role = Some(winner.value.clone()),
            "alias" => update.aliases.push(winner.value.clone()),
            "affiliation" | "organization" => {
                let known = diff
                    .organizations
                    .iter()
                    .any(|o| o.name.eq_ignore_ascii_case(&winner.value));
                if !known {
                    diff.organizations.push(OrganizationState {
                        name: winner.value.clone(),
                        description: None,
                        last_mentioned_scene: winner.fact.scene_number,
                    });
                }
                update
                    .attributes
                    .insert(winner.attribute.clone(), winner.value.clone());
            }
            attribute => {
                update
                    .attributes
                    .insert(attribute.to_string(), winner.value.clone());
            }
        }
    }
    diff.character_updates = updates.into_values().collect();

    diff.key_facts = events
        .iter()
        .filter(|e| e.significance == Significance::Major)
        .map(|e| format!("Scene {}: {}", e.scene_number, e.event))
        .collect();
    diff.timeline_events = events;
    diff
}
