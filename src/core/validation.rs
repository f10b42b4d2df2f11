//! Structural validation of step outputs and continuity outcomes.
//!
//! A failing output gets exactly one repair attempt. For steps that means
//! re-running the step with the errors as feedback; for continuity outcomes
//! it means pruning the offending entries. A second failure is fatal.

use std::collections::HashSet;

use thiserror::Error;

use crate::domain::StepName;

use super::continuity::ContinuityOutcome;
use super::limits::GenerationLimits;
use super::steps::{OutputKind, StepOutput};

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Output of '{step}' failed validation: {}", .errors.join("; "))]
    Invalid { step: String, errors: Vec<String> },

    #[error("Repair of '{step}' failed: {}", .errors.join("; "))]
    RepairFailed { step: String, errors: Vec<String> },
}

impl ValidationError {
    pub fn errors(&self) -> &[String] {
        match self {
            ValidationError::Invalid { errors, .. } | ValidationError::RepairFailed { errors, .. } => {
                errors
            }
        }
    }
}

/// Decode raw step output and check it against the phase contract
pub fn decode_output(
    step: StepName,
    raw: &serde_json::Value,
    expected: OutputKind,
    limits: &GenerationLimits,
) -> Result<StepOutput, ValidationError> {
    let invalid = |errors: Vec<String>| ValidationError::Invalid {
        step: step.to_string(),
        errors,
    };

    if !raw.is_object() {
        return Err(invalid(vec!["output must be a JSON object".to_string()]));
    }

    let output: StepOutput = serde_json::from_value(raw.clone())
        .map_err(|e| invalid(vec![format!("output does not match any known shape: {}", e)]))?;

    let mut errors = Vec::new();

    if output.kind() != expected {
        errors.push(format!(
            "expected output kind {:?}, got {:?}",
            expected,
            output.kind()
        ));
    }

    if let Some(content) = output.content() {
        if content.trim().is_empty() {
            errors.push("content must not be empty".to_string());
        }
        if let Err(violation) = limits.validate_output(content) {
            errors.push(violation.to_string());
        }
    }

    for (index, fact) in output.facts().iter().enumerate() {
        if fact.trim().is_empty() {
            errors.push(format!("fact {} is empty", index));
        }
    }

    if let StepOutput::Critique { approved: false, notes } = &output {
        if notes.iter().all(|n| n.trim().is_empty()) {
            errors.push("a rejected draft needs at least one note".to_string());
        }
    }

    if errors.is_empty() {
        Ok(output)
    } else {
        Err(invalid(errors))
    }
}

/// Structural errors in a continuity outcome (empty when valid)
pub fn check_outcome(outcome: &ContinuityOutcome) -> Vec<String> {
    let mut errors = Vec::new();
    let mut keys = HashSet::new();

    for constraint in &outcome.constraints {
        if !is_valid_key(&constraint.key) {
            errors.push(format!("malformed constraint key '{}'", constraint.key));
        }
        if !keys.insert(constraint.key.as_str()) {
            errors.push(format!("duplicate constraint key '{}'", constraint.key));
        }
        if constraint.scene_number > outcome.scene {
            errors.push(format!(
                "constraint '{}' comes from future scene {}",
                constraint.key, constraint.scene_number
            ));
        }
    }

    let diff = &outcome.diff;
    if diff.character_updates.iter().any(|c| c.name.trim().is_empty()) {
        errors.push("character update without a name".to_string());
    }
    if diff.new_locations.iter().any(|l| l.name.trim().is_empty()) {
        errors.push("location without a name".to_string());
    }
    if diff.organizations.iter().any(|o| o.name.trim().is_empty()) {
        errors.push("organization without a name".to_string());
    }
    for event in &diff.timeline_events {
        if event.event.trim().is_empty() {
            errors.push("empty timeline event".to_string());
        }
        if event.scene_number > outcome.scene {
            errors.push(format!(
                "timeline event '{}' comes from future scene {}",
                event.event, event.scene_number
            ));
        }
    }

    errors
}

/// Drop every entry `check_outcome` would complain about
pub fn prune_outcome(mut outcome: ContinuityOutcome) -> ContinuityOutcome {
    let scene = outcome.scene;
    let mut keys = HashSet::new();
    outcome.constraints.retain(|c| {
        is_valid_key(&c.key) && c.scene_number <= scene && keys.insert(c.key.clone())
    });
    outcome.updated_keys.retain(|k| keys.contains(k));

    let diff = &mut outcome.diff;
    diff.character_updates.retain(|c| !c.name.trim().is_empty());
    diff.new_locations.retain(|l| !l.name.trim().is_empty());
    diff.organizations.retain(|o| !o.name.trim().is_empty());
    diff.timeline_events
        .retain(|e| !e.event.trim().is_empty() && e.scene_number <= scene);
    outcome
}

fn is_valid_key(key: &str) -> bool {
    match key.split_once('.') {
        Some((subject, attribute)) => !subject.trim().is_empty() && !attribute.trim().is_empty(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{KeyConstraint, TimelineFact, Significance, WorldStateDiff};
    use chrono::Utc;
    use serde_json::json;

    fn limits() -> GenerationLimits {
        GenerationLimits::default()
    }

    #[test]
    fn test_valid_draft() {
        let raw = json!({"kind": "draft", "content": "Rain fell.", "facts": ["Elena has blue eyes"]});
        let output = decode_output(StepName::Writer, &raw, OutputKind::Draft, &limits()).unwrap();
        assert_eq!(output.content(), Some("Rain fell."));
    }

    #[test]
    fn test_wrong_kind_and_empty_content() {
        let raw = json!({"kind": "artifact", "content": "  "});
        let err = decode_output(StepName::Writer, &raw, OutputKind::Draft, &limits()).unwrap_err();
        assert_eq!(err.errors().len(), 2);
        assert!(matches!(err, ValidationError::Invalid { .. }));
    }

    #[test]
    fn test_undecodable_output() {
        let err = decode_output(StepName::Critic, &json!("text"), OutputKind::Critique, &limits())
            .unwrap_err();
        assert!(err.to_string().contains("JSON object"));

        let err = decode_output(StepName::Critic, &json!({"kind": "poem"}), OutputKind::Critique, &limits())
            .unwrap_err();
        assert!(err.to_string().contains("known shape"));
    }

    #[test]
    fn test_rejection_needs_notes() {
        let raw = json!({"kind": "critique", "approved": false});
        assert!(decode_output(StepName::Critic, &raw, OutputKind::Critique, &limits()).is_err());

        let raw = json!({"kind": "critique", "approved": false, "notes": ["Pacing drags"]});
        assert!(decode_output(StepName::Critic, &raw, OutputKind::Critique, &limits()).is_ok());
    }

    #[test]
    fn test_oversized_output() {
        let small = GenerationLimits {
            max_output_bytes: 10,
            ..Default::default()
        };
        let raw = json!({"kind": "artifact", "content": "x".repeat(50)});
        assert!(decode_output(StepName::Architect, &raw, OutputKind::Artifact, &small).is_err());
    }

    fn constraint(key: &str, scene: u32) -> KeyConstraint {
        KeyConstraint {
            key: key.to_string(),
            value: "v".to_string(),
            source: StepName::Archivist,
            scene_number: scene,
            timestamp: Utc::now(),
            reasoning: None,
        }
    }

    #[test]
    fn test_outcome_check_and_prune() {
        let mut diff = WorldStateDiff::empty(2);
        diff.timeline_events.push(TimelineFact {
            event: "Too early".to_string(),
            scene_number: 5,
            significance: Significance::Minor,
            timestamp: Utc::now(),
        });
        let outcome = ContinuityOutcome {
            scene: 2,
            constraints: vec![
                constraint("Elena.eyes", 1),
                constraint("Elena.eyes", 2),
                constraint("nokey", 1),
                constraint("Marcus.status", 4),
            ],
            updated_keys: vec!["Elena.eyes".to_string(), "Marcus.status".to_string()],
            diff,
            discarded: Vec::new(),
        };

        let errors = check_outcome(&outcome);
        assert_eq!(errors.len(), 4);

        let pruned = prune_outcome(outcome);
        assert!(check_outcome(&pruned).is_empty());
        assert_eq!(pruned.constraints.len(), 1);
        assert_eq!(pruned.updated_keys, vec!["Elena.eyes".to_string()]);
        assert!(pruned.diff.timeline_events.is_empty());
    }
}
