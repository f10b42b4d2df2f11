//! Step dispatch: the context handed to a step, the outputs it may return,
//! and the registry that maps step names to implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapters::Step;
use crate::domain::{KeyConstraint, PhaseName, StepName, WorldState};

/// Shape of output a step is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Artifact,
    Draft,
    Critique,
}

/// Role of a step within its phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    Primary,
    Supporting,
}

/// Everything a step sees. Serialized as JSON for external steps.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepContext {
    pub run_id: Uuid,
    pub project_id: String,
    pub step: StepName,
    pub phase: PhaseName,
    pub role: StepRole,
    pub expects: OutputKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene: Option<u32>,
    pub total_scenes: u32,
    /// Contents of the artifacts this phase depends on, plus supporting notes
    pub artifacts: BTreeMap<String, String>,
    /// Current scene draft (revision and continuity)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft: Option<String>,
    /// Critic notes to address (writer redraft)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub critique_notes: Vec<String>,
    /// Canonical facts the step must not contradict
    pub key_constraints: Vec<KeyConstraint>,
    pub world_state: WorldState,
    /// Revision round (1-based) when inside the revision loop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    /// Structural errors of the previous attempt, set on the repair attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_feedback: Option<Vec<String>>,
}

/// Decoded step output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutput {
    Artifact {
        content: String,
        #[serde(default)]
        facts: Vec<String>,
    },
    Draft {
        content: String,
        #[serde(default)]
        facts: Vec<String>,
    },
    Critique {
        approved: bool,
        #[serde(default)]
        notes: Vec<String>,
    },
}

impl StepOutput {
    pub fn kind(&self) -> OutputKind {
        match self {
            StepOutput::Artifact { .. } => OutputKind::Artifact,
            StepOutput::Draft { .. } => OutputKind::Draft,
            StepOutput::Critique { .. } => OutputKind::Critique,
        }
    }

    /// Raw facts the step reported alongside its output
    pub fn facts(&self) -> &[String] {
        match self {
            StepOutput::Artifact { facts, .. } | StepOutput::Draft { facts, .. } => facts,
            StepOutput::Critique { .. } => &[],
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            StepOutput::Artifact { content, .. } | StepOutput::Draft { content, .. } => {
                Some(content)
            }
            StepOutput::Critique { .. } => None,
        }
    }
}

/// What a step must return when acting in a phase
pub fn expected_output(phase: PhaseName, step: StepName) -> OutputKind {
    match (phase, step) {
        (PhaseName::Drafting | PhaseName::Revision, StepName::Writer) => OutputKind::Draft,
        (PhaseName::Revision, StepName::Critic) => OutputKind::Critique,
        _ => OutputKind::Artifact,
    }
}

/// Dispatch table from step name to implementation
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<StepName, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: StepName, step: Arc<dyn Step>) -> &mut Self {
        self.steps.insert(name, step);
        self
    }

    pub fn with(mut self, name: StepName, step: Arc<dyn Step>) -> Self {
        self.register(name, step);
        self
    }

    pub fn get(&self, name: StepName) -> Option<&Arc<dyn Step>> {
        self.steps.get(&name)
    }

    /// Steps from `required` that have no implementation
    pub fn missing(&self, required: impl IntoIterator<Item = StepName>) -> Vec<StepName> {
        let mut missing: Vec<StepName> = required
            .into_iter()
            .filter(|name| !self.steps.contains_key(name))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    pub fn names(&self) -> Vec<StepName> {
        let mut names: Vec<StepName> = self.steps.keys().copied().collect();
        names.sort();
        names
    }

    /// Execute a step, bounded by `timeout`
    pub async fn execute(
        &self,
        context: &StepContext,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let step = self
            .get(context.step)
            .with_context(|| format!("No implementation registered for step '{}'", context.step))?;

        tokio::time::timeout(timeout, step.execute(context, timeout))
            .await
            .with_context(|| format!("Step '{}' timed out after {:?}", context.step, timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixed(serde_json::Value);

    #[async_trait]
    impl Step for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn execute(&self, _context: &StepContext, _timeout: Duration) -> Result<serde_json::Value> {
            Ok(self.0.clone())
        }
    }

    struct Slow;

    #[async_trait]
    impl Step for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _context: &StepContext, _timeout: Duration) -> Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
    }

    fn context(step: StepName) -> StepContext {
        let run_id = Uuid::new_v4();
        StepContext {
            run_id,
            project_id: "p".to_string(),
            step,
            phase: PhaseName::Premise,
            role: StepRole::Primary,
            expects: OutputKind::Artifact,
            scene: None,
            total_scenes: 1,
            artifacts: BTreeMap::new(),
            draft: None,
            critique_notes: Vec::new(),
            key_constraints: Vec::new(),
            world_state: WorldState::new(run_id),
            iteration: None,
            repair_feedback: None,
        }
    }

    #[test]
    fn test_output_decoding() {
        let output: StepOutput = serde_json::from_value(json!({
            "kind": "draft",
            "content": "Rain.",
            "facts": ["Elena has blue eyes"]
        }))
        .unwrap();
        assert_eq!(output.kind(), OutputKind::Draft);
        assert_eq!(output.facts(), ["Elena has blue eyes".to_string()]);

        let critique: StepOutput =
            serde_json::from_value(json!({"kind": "critique", "approved": true})).unwrap();
        assert_eq!(critique.content(), None);
    }

    #[test]
    fn test_expected_output_per_role() {
        assert_eq!(expected_output(PhaseName::Revision, StepName::Critic), OutputKind::Critique);
        assert_eq!(expected_output(PhaseName::Revision, StepName::Writer), OutputKind::Draft);
        assert_eq!(expected_output(PhaseName::Drafting, StepName::Writer), OutputKind::Draft);
        assert_eq!(expected_output(PhaseName::Characters, StepName::Architect), OutputKind::Artifact);
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let registry = StepRegistry::new().with(
            StepName::Architect,
            Arc::new(Fixed(json!({"kind": "artifact", "content": "A premise"}))),
        );

        let value = registry
            .execute(&context(StepName::Architect), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value["content"], "A premise");

        let missing = registry
            .execute(&context(StepName::Critic), Duration::from_secs(1))
            .await;
        assert!(missing.is_err());
        assert_eq!(
            registry.missing([StepName::Critic, StepName::Architect, StepName::Critic]),
            vec![StepName::Critic]
        );
    }

    #[tokio::test]
    async fn test_registry_enforces_timeout() {
        let registry = StepRegistry::new().with(StepName::Writer, Arc::new(Slow));
        let result = registry
            .execute(&context(StepName::Writer), Duration::from_millis(20))
            .await;
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }
}
