//! External command step.
//!
//! Spawns a configured program, pipes the step context as JSON to stdin and
//! reads the step output as JSON from stdout.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::StepCommandConfig;
use crate::core::steps::StepContext;

use super::Step;

/// Step backed by a subprocess
#[derive(Debug, Clone)]
pub struct CommandStep {
    program: String,
    args: Vec<String>,
}

impl CommandStep {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &StepCommandConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }

    /// Run the program with `input` on stdin and return its stdout
    async fn run(&self, step: &str, input: &str, step_timeout: Duration) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("CHRONICLE_STEP", step)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}' for step '{}'", self.program, step))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .with_context(|| format!("Failed to write to stdin of step '{}'", step))?;
            // Drop stdin to signal EOF
        }

        let output = timeout(step_timeout, child.wait_with_output())
            .await
            .with_context(|| format!("Step '{}' timed out after {:?}", step, step_timeout))?
            .with_context(|| format!("Failed to wait for step '{}'", step))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Step '{}' failed with exit code {}: {}",
                step,
                exit_code,
                stderr.trim()
            );
        }

        String::from_utf8(output.stdout)
            .with_context(|| format!("Output of step '{}' is not valid UTF-8", step))
    }
}

#[async_trait]
impl Step for CommandStep {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(&self, context: &StepContext, timeout: Duration) -> Result<serde_json::Value> {
        let step = context.step.as_str();
        let input = serde_json::to_string(context).context("Failed to serialize step context")?;
        let stdout = self.run(step, &input, timeout).await?;

        serde_json::from_str(stdout.trim())
            .with_context(|| format!("Output of step '{}' is not valid JSON", step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::steps::{OutputKind, StepRole};
    use crate::domain::{PhaseName, StepName, WorldState};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn context() -> StepContext {
        let run_id = Uuid::new_v4();
        StepContext {
            run_id,
            project_id: "p".to_string(),
            step: StepName::Architect,
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

    fn sh(script: &str) -> CommandStep {
        CommandStep::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_reads_json_from_stdout() {
        let step = sh(r#"cat > /dev/null; echo '{"kind":"artifact","content":"A premise"}'"#);
        let value = step.execute(&context(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(value["content"], "A premise");
    }

    #[tokio::test]
    async fn test_context_reaches_stdin() {
        // Echo the context back: the step name must round-trip
        let step = sh("cat");
        let value = step.execute(&context(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(value["step"], "architect");
        assert_eq!(value["expects"], "artifact");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let step = sh("cat > /dev/null; echo boom >&2; exit 3");
        let err = step.execute(&context(), Duration::from_secs(5)).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit code 3"), "{}", message);
        assert!(message.contains("boom"), "{}", message);
    }

    #[tokio::test]
    async fn test_invalid_json_is_an_error() {
        let step = sh("cat > /dev/null; echo not-json");
        assert!(step.execute(&context(), Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout() {
        let step = sh("sleep 5");
        let err = step
            .execute(&context(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
