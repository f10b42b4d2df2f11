//! Run orchestrator.
//!
//! Drives one run through the phase table as a tokio task. Coordinates step
//! execution with retry, output validation and repair, the revision loop,
//! continuity passes and checkpointing, and publishes progress to the run's
//! event log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    Artifact, ArtifactKind, Critique, EventType, GenerationState, PhaseName, RawFact, RunProgress,
    StepName,
};
use crate::stream::{EventGateway, EventPublisher};

use super::continuity::{ContinuityEngine, ContinuityOutcome};
use super::limits::{GenerationLimits, LimitTracker};
use super::phases::{self, PhaseSpec, RetryPolicy, PHASES};
use super::recovery::{RecoveryManager, SnapshotInfo};
use super::registry::{ControlSignal, RunHandle, RunRegistry};
use super::steps::{expected_output, StepContext, StepOutput, StepRegistry, StepRole};
use super::validation::{check_outcome, decode_output, prune_outcome, ValidationError};

/// Request to start a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub project_id: String,
    pub total_scenes: u32,
    /// Stop after this run-level phase. Its `phase_complete` is tagged `final`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_after: Option<PhaseName>,
    /// Explicit run id, otherwise a fresh one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

impl RunRequest {
    pub fn new(project_id: impl Into<String>, total_scenes: u32) -> Self {
        Self {
            project_id: project_id.into(),
            total_scenes,
            stop_after: None,
            run_id: None,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    Completed,
    Stopped { phase: PhaseName },
    Cancelled { phase: PhaseName, scene: u32 },
    Failed { error: String },
}

/// A run handed to its task
pub struct StartedRun {
    pub handle: RunHandle,
    pub task: JoinHandle<RunOutcome>,
}

/// Status of a run, live or finished
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusView {
    pub run_id: Uuid,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<ControlSignal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_scene: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_phase: Option<PhaseName>,
    /// Replayed from the run's event log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<RunProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotInfo>,
}

enum Flow {
    Completed,
    Stopped(PhaseName),
    Cancelled,
}

struct RunOptions {
    stop_after: Option<PhaseName>,
    /// Checkpoint of the snapshot this run was resumed from, until passed
    resumed_from: Option<(u32, PhaseName)>,
}

/// Main run orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    steps: StepRegistry,
    publisher: EventPublisher,
    gateway: EventGateway,
    registry: Arc<RunRegistry>,
    recovery: RecoveryManager,
    engine: ContinuityEngine,
    limits: GenerationLimits,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        steps: StepRegistry,
        publisher: EventPublisher,
        gateway: EventGateway,
        registry: Arc<RunRegistry>,
        recovery: RecoveryManager,
    ) -> Self {
        Self {
            steps,
            publisher,
            gateway,
            registry,
            recovery,
            engine: ContinuityEngine::default(),
            limits: GenerationLimits::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_limits(mut self, limits: GenerationLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_engine(mut self, engine: ContinuityEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn gateway(&self) -> &EventGateway {
        &self.gateway
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Validate a request, register the run and spawn its task
    #[instrument(skip(self, request), fields(project = %request.project_id))]
    pub async fn start(&self, request: RunRequest) -> Result<StartedRun> {
        self.limits.validate_request(request.total_scenes)?;

        if let Some(phase) = request.stop_after {
            if phases::spec(phase).per_scene {
                anyhow::bail!("stopAfter must name a run-level phase, got '{}'", phase);
            }
        }

        let needed = PHASES
            .iter()
            .filter(|p| request.stop_after.map_or(true, |stop| p.name <= stop))
            .flat_map(|p| p.steps());
        let missing = self.steps.missing(needed);
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
            anyhow::bail!("No implementation registered for steps: {}", names.join(", "));
        }

        let run_id = request.run_id.unwrap_or_else(Uuid::new_v4);
        let handle = self.registry.create(run_id, &request.project_id).await?;
        let state = GenerationState::new(run_id, request.project_id, request.total_scenes);

        info!(%run_id, total_scenes = request.total_scenes, "Starting run");
        Ok(self.spawn(
            handle,
            state,
            RunOptions {
                stop_after: request.stop_after,
                resumed_from: None,
            },
        ))
    }

    /// Resume an interrupted run from its snapshot
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn resume(&self, run_id: Uuid) -> Result<StartedRun> {
        let snapshot = self
            .recovery
            .load(run_id)
            .with_context(|| format!("No usable snapshot for run {}", run_id))?;

        if !snapshot.is_resumable() {
            anyhow::bail!("Run {} had already finished and cannot be resumed", run_id);
        }

        let checkpoint = snapshot.checkpoint();
        let mut state = snapshot.state;
        state.is_paused = false;

        let handle = self.registry.create(run_id, &state.project_id).await?;
        info!(scene = checkpoint.0, phase = %checkpoint.1, "Resuming run from snapshot");

        Ok(self.spawn(
            handle,
            state,
            RunOptions {
                stop_after: None,
                resumed_from: Some(checkpoint),
            },
        ))
    }

    /// Status of a live run, or of a finished one through its log and snapshot.
    /// `None` when nothing is known about the run.
    pub async fn status(&self, run_id: Uuid) -> Result<Option<RunStatusView>> {
        let handle = self.registry.get(run_id).await;
        let (signal, checkpoint) = match &handle {
            Some(handle) => (
                Some(handle.control.signal()),
                handle
                    .control
                    .last_checkpoint()
                    .await
                    .map(|s| s.checkpoint()),
            ),
            None => (None, None),
        };

        let progress = if self.gateway.is_enabled() {
            let history = self
                .gateway
                .get_history(run_id, self.gateway.settings().history_limit)
                .await
                .context("Failed to read run history")?;
            RunProgress::from_events(&history)
        } else {
            None
        };

        let snapshot = self.recovery.info(run_id).ok();

        if handle.is_none() && progress.is_none() && snapshot.is_none() {
            return Ok(None);
        }

        Ok(Some(RunStatusView {
            run_id,
            live: handle.is_some(),
            signal,
            checkpoint_scene: checkpoint.map(|(scene, _)| scene),
            checkpoint_phase: checkpoint.map(|(_, phase)| phase),
            progress,
            snapshot,
        }))
    }

    fn spawn(&self, handle: RunHandle, state: GenerationState, options: RunOptions) -> StartedRun {
        let orchestrator = self.clone();
        let task_handle = handle.clone();
        let task = tokio::spawn(async move { orchestrator.drive(task_handle, state, options).await });
        StartedRun { handle, task }
    }

    #[instrument(skip_all, fields(run_id = %handle.run_id))]
    async fn drive(
        self,
        handle: RunHandle,
        mut state: GenerationState,
        mut options: RunOptions,
    ) -> RunOutcome {
        let run_id = handle.run_id;
        let mut tracker = LimitTracker::new();

        self.emit(
            run_id,
            EventType::GenerationStarted,
            json!({
                "projectId": state.project_id,
                "totalScenes": state.total_scenes,
                "phase": state.phase,
                "scene": state.current_scene,
                "resumed": options.resumed_from.is_some(),
            }),
        )
        .await;

        let outcome = match self
            .run_phases(&handle, &mut state, &mut tracker, &mut options)
            .await
        {
            Ok(Flow::Completed) => {
                state.mark_completed();
                self.emit(
                    run_id,
                    EventType::GenerationComplete,
                    json!({
                        "totalScenes": state.total_scenes,
                        "constraints": state.key_constraints.len(),
                        "stepsExecuted": tracker.step_calls,
                    }),
                )
                .await;
                RunOutcome::Completed
            }
            Ok(Flow::Stopped(phase)) => {
                state.mark_completed();
                RunOutcome::Stopped { phase }
            }
            Ok(Flow::Cancelled) => {
                self.emit(
                    run_id,
                    EventType::GenerationCancelled,
                    json!({"phase": state.phase, "scene": state.current_scene}),
                )
                .await;
                RunOutcome::Cancelled {
                    phase: state.phase,
                    scene: state.current_scene,
                }
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(phase = %state.phase, scene = state.current_scene, error = %message, "Run failed");
                state.mark_failed(message.clone());
                self.emit(
                    run_id,
                    EventType::GenerationError,
                    json!({
                        "error": message,
                        "phase": state.phase,
                        "scene": state.current_scene,
                    }),
                )
                .await;
                RunOutcome::Failed { error: message }
            }
        };

        handle.control.save_checkpoint(&state).await;
        if !matches!(outcome, RunOutcome::Failed { .. }) {
            self.discard_snapshot(run_id);
        }
        self.registry.destroy(run_id).await;

        info!(?outcome, steps = tracker.step_calls, "Run finished");
        outcome
    }

    async fn run_phases(
        &self,
        handle: &RunHandle,
        state: &mut GenerationState,
        tracker: &mut LimitTracker,
        options: &mut RunOptions,
    ) -> Result<Flow> {
        let run_id = handle.run_id;

        loop {
            // Phase boundary: checkpoint, then honour pause and cancel
            handle.control.save_checkpoint(state).await;
            self.release_snapshot(state, options);
            if self.hold_at_boundary(handle, state).await {
                return Ok(Flow::Cancelled);
            }
            self.limits.check(tracker)?;

            let spec = phases::spec(state.phase);
            let scene = state.current_scene;

            let missing = phases::missing_artifacts(spec.name, state);
            if !missing.is_empty() {
                anyhow::bail!(
                    "Phase '{}' cannot begin, missing artifacts: {}",
                    spec.name,
                    missing.join(", ")
                );
            }

            debug!(phase = %spec.name, scene, "Phase starting");
            self.emit(
                run_id,
                EventType::PhaseStart,
                phase_payload(spec, scene, json!({"step": spec.primary})),
            )
            .await;

            let started = Instant::now();
            let detail = match spec.name {
                PhaseName::Revision => self.run_revision(spec, state, tracker).await?,
                PhaseName::Continuity => self.run_continuity(spec, state, tracker).await?,
                _ => self.run_phase(spec, state, tracker).await?,
            };

            let stop_here = options.stop_after == Some(spec.name);
            let mut payload = phase_payload(spec, scene, detail);
            payload["durationMs"] = json!(started.elapsed().as_millis() as u64);
            if stop_here {
                payload["final"] = json!(true);
            }
            self.emit(run_id, EventType::PhaseComplete, payload).await;

            if stop_here {
                return Ok(Flow::Stopped(spec.name));
            }

            match phases::advance(scene, spec.name, state.total_scenes) {
                Some((next_scene, next_phase)) => {
                    state.current_scene = next_scene;
                    state.phase = next_phase;
                    state.touch();
                }
                None => return Ok(Flow::Completed),
            }
        }
    }

    /// Returns true when the run was cancelled
    async fn hold_at_boundary(&self, handle: &RunHandle, state: &mut GenerationState) -> bool {
        match handle.control.signal() {
            ControlSignal::Running => false,
            ControlSignal::Cancelled => true,
            ControlSignal::Paused => {
                state.is_paused = true;
                state.touch();
                handle.control.save_checkpoint(state).await;

                info!(phase = %state.phase, scene = state.current_scene, "Run paused");
                let payload = json!({"phase": state.phase, "scene": state.current_scene});
                self.emit(handle.run_id, EventType::GenerationPaused, payload.clone())
                    .await;

                let signal = handle.control.wait_while_paused().await;
                state.is_paused = false;
                if signal == ControlSignal::Cancelled {
                    return true;
                }

                info!(phase = %state.phase, scene = state.current_scene, "Run resumed");
                self.emit(handle.run_id, EventType::GenerationResumed, payload)
                    .await;
                false
            }
        }
    }

    /// Delete the snapshot a resumed run started from once it is behind us
    fn release_snapshot(&self, state: &GenerationState, options: &mut RunOptions) {
        if let Some(from) = options.resumed_from {
            if state.checkpoint() > from {
                self.discard_snapshot(state.run_id);
                options.resumed_from = None;
            }
        }
    }

    fn discard_snapshot(&self, run_id: Uuid) {
        match self.recovery.delete(run_id) {
            Ok(true) => debug!(%run_id, "Snapshot released"),
            Ok(false) => {}
            Err(e) => warn!(%run_id, error = %e, "Failed to delete snapshot"),
        }
    }

    /// Single-pass phase: supporting steps first, their notes go to the primary
    async fn run_phase(
        &self,
        spec: &'static PhaseSpec,
        state: &mut GenerationState,
        tracker: &mut LimitTracker,
    ) -> Result<Value> {
        let scene = state.current_scene;

        let mut notes = BTreeMap::new();
        for &step in spec.supporting {
            let context = self.context(state, spec, step, StepRole::Supporting);
            let output = self.execute_validated(&context, tracker).await?;
            self.record_facts(state, step, &output).await;
            if let Some(content) = output.content() {
                notes.insert(format!("{}_notes", step), content.to_string());
            }
        }

        let mut context = self.context(state, spec, spec.primary, StepRole::Primary);
        context.artifacts.extend(notes);
        let output = self.execute_validated(&context, tracker).await?;
        let facts = self.record_facts(state, spec.primary, &output).await;

        let bytes = match output {
            StepOutput::Draft { content, .. } => {
                let bytes = content.len();
                state.record_draft(scene, content);
                self.emit(
                    state.run_id,
                    EventType::DraftProduced,
                    json!({"scene": scene, "iteration": 0, "bytes": bytes}),
                )
                .await;
                bytes
            }
            StepOutput::Artifact { content, .. } => {
                let bytes = content.len();
                state.artifacts.insert(
                    spec.artifact_key(scene),
                    Artifact::from_output(spec.artifact, spec.primary, content),
                );
                state.touch();
                bytes
            }
            other => anyhow::bail!(
                "Step '{}' returned {:?} output in phase '{}'",
                spec.primary,
                other.kind(),
                spec.name
            ),
        };

        Ok(json!({"artifact": spec.artifact, "bytes": bytes, "facts": facts}))
    }

    /// Critic review and writer redraft until approval or the revision limit
    async fn run_revision(
        &self,
        spec: &'static PhaseSpec,
        state: &mut GenerationState,
        tracker: &mut LimitTracker,
    ) -> Result<Value> {
        let scene = state.current_scene;
        let mut iteration = state.critiques.get(&scene).map_or(0, |c| c.len() as u32);

        let approved = loop {
            iteration += 1;

            let mut context = self.context(state, spec, StepName::Critic, StepRole::Primary);
            context.iteration = Some(iteration);
            let (approved, notes) = match self.execute_validated(&context, tracker).await? {
                StepOutput::Critique { approved, notes } => (approved, notes),
                other => anyhow::bail!("Critic returned {:?} output", other.kind()),
            };

            self.emit(
                state.run_id,
                EventType::CritiqueProduced,
                json!({
                    "scene": scene,
                    "iteration": iteration,
                    "approved": approved,
                    "notes": notes,
                }),
            )
            .await;
            state.record_critique(
                scene,
                Critique {
                    approved,
                    notes: notes.clone(),
                    iteration,
                    timestamp: Utc::now(),
                },
            );

            if approved {
                break true;
            }

            let revisions = state.revision_count.get(&scene).copied().unwrap_or(0);
            if revisions >= self.limits.max_revisions {
                warn!(scene, revisions, "Revision limit reached, keeping current draft");
                self.emit(
                    state.run_id,
                    EventType::RevisionLimitReached,
                    json!({
                        "scene": scene,
                        "revisions": revisions,
                        "limit": self.limits.max_revisions,
                    }),
                )
                .await;
                break false;
            }

            let mut context = self.context(state, spec, StepName::Writer, StepRole::Supporting);
            context.iteration = Some(iteration);
            context.critique_notes = notes;
            let output = self.execute_validated(&context, tracker).await?;
            self.record_facts(state, StepName::Writer, &output).await;

            let content = match output {
                StepOutput::Draft { content, .. } => content,
                other => anyhow::bail!("Writer returned {:?} output", other.kind()),
            };
            let bytes = content.len();
            state.record_draft(scene, content);
            let revision = state.bump_revision(scene);

            self.emit(
                state.run_id,
                EventType::DraftProduced,
                json!({
                    "scene": scene,
                    "iteration": iteration,
                    "revision": revision,
                    "bytes": bytes,
                }),
            )
            .await;
        };

        let draft = state.drafts.get(&scene).cloned().unwrap_or_default();
        state.artifacts.insert(
            spec.artifact_key(scene),
            Artifact::new(spec.artifact, StepName::Writer, ArtifactKind::Draft, draft),
        );
        state.touch();

        Ok(json!({
            "approved": approved,
            "iterations": iteration,
            "revisions": state.revision_count.get(&scene).copied().unwrap_or(0),
        }))
    }

    /// Archivist bookkeeping followed by a continuity pass, when due
    async fn run_continuity(
        &self,
        spec: &'static PhaseSpec,
        state: &mut GenerationState,
        tracker: &mut LimitTracker,
    ) -> Result<Value> {
        let scene = state.current_scene;
        if !self
            .limits
            .continuity_due(scene, state.last_archivist_scene, state.total_scenes)
        {
            debug!(scene, last = state.last_archivist_scene, "Continuity pass not due");
            return Ok(json!({"skipped": true}));
        }

        let context = self.context(state, spec, StepName::Archivist, StepRole::Primary);
        let output = self.execute_validated(&context, tracker).await?;
        self.record_facts(state, StepName::Archivist, &output).await;
        let notes = output.content().unwrap_or_default().to_string();

        let facts = state.facts_up_to(scene);
        let outcome = self
            .engine
            .resolve(&facts, &state.key_constraints, &state.world_state, scene);
        let outcome = self.validate_outcome(state.run_id, outcome).await?;
        // Every pass re-resolves the whole log, so losers of earlier passes come back
        let discarded = state.take_new_discards(&outcome.discarded);

        state.key_constraints = outcome.constraints.clone();
        state.world_state.apply_diff(&outcome.diff);
        state.last_archivist_scene = scene;
        state.touch();

        info!(
            scene,
            updated = outcome.updated_keys.len(),
            discarded = discarded.len(),
            "Continuity pass applied"
        );

        self.emit(
            state.run_id,
            EventType::ConstraintsUpdated,
            json!({
                "scene": scene,
                "updatedKeys": outcome.updated_keys,
                "total": outcome.constraints.len(),
                "discarded": discarded,
            }),
        )
        .await;
        self.emit(
            state.run_id,
            EventType::WorldStateUpdated,
            json!({
                "scene": scene,
                "lastUpdatedScene": state.world_state.last_updated_scene,
                "diff": outcome.diff,
            }),
        )
        .await;

        let report = json!({
            "scene": scene,
            "notes": notes,
            "updatedKeys": outcome.updated_keys,
            "constraints": outcome.constraints.len(),
            "discarded": discarded.len(),
            "characters": state.world_state.characters.len(),
            "locations": state.world_state.locations.len(),
            "timelineEvents": state.world_state.timeline.len(),
        });
        state.artifacts.insert(
            spec.artifact_key(scene),
            Artifact::from_output(spec.artifact, StepName::Archivist, report.to_string()),
        );

        Ok(json!({
            "updatedKeys": outcome.updated_keys.len(),
            "discarded": discarded.len(),
        }))
    }

    /// One repair attempt for a continuity outcome: prune what fails the checks
    async fn validate_outcome(
        &self,
        run_id: Uuid,
        outcome: ContinuityOutcome,
    ) -> Result<ContinuityOutcome, ValidationError> {
        let errors = check_outcome(&outcome);
        if errors.is_empty() {
            return Ok(outcome);
        }

        warn!(scene = outcome.scene, ?errors, "Continuity outcome failed validation, pruning");
        self.emit(
            run_id,
            EventType::StepRepairing,
            json!({"step": "continuity", "scene": outcome.scene, "errors": errors}),
        )
        .await;

        let pruned = prune_outcome(outcome);
        let remaining = check_outcome(&pruned);
        if remaining.is_empty() {
            Ok(pruned)
        } else {
            Err(ValidationError::RepairFailed {
                step: "continuity".to_string(),
                errors: remaining,
            })
        }
    }

    /// Execute a step and decode its output, with one repair attempt
    async fn execute_validated(
        &self,
        context: &StepContext,
        tracker: &mut LimitTracker,
    ) -> Result<StepOutput> {
        let raw = self.execute_with_retry(context, tracker).await?;
        let error = match decode_output(context.step, &raw, context.expects, &self.limits) {
            Ok(output) => return Ok(output),
            Err(e) => e,
        };

        warn!(step = %context.step, errors = ?error.errors(), "Step output failed validation, repairing");
        self.emit(
            context.run_id,
            EventType::StepRepairing,
            json!({
                "step": context.step,
                "phase": context.phase,
                "scene": context.scene,
                "errors": error.errors(),
            }),
        )
        .await;

        let mut repair = context.clone();
        repair.repair_feedback = Some(error.errors().to_vec());
        let raw = self.execute_with_retry(&repair, tracker).await?;

        decode_output(context.step, &raw, context.expects, &self.limits).map_err(|e| {
            ValidationError::RepairFailed {
                step: context.step.to_string(),
                errors: e.errors().to_vec(),
            }
            .into()
        })
    }

    /// Execute a step, retrying transient failures per the retry policy
    async fn execute_with_retry(
        &self,
        context: &StepContext,
        tracker: &mut LimitTracker,
    ) -> Result<Value> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.limits.check(tracker)?;

            self.emit(
                context.run_id,
                EventType::StepStarted,
                json!({
                    "step": context.step,
                    "phase": context.phase,
                    "scene": context.scene,
                    "role": context.role,
                    "attempt": attempt,
                }),
            )
            .await;

            let started = Instant::now();
            let result = self.steps.execute(context, self.limits.step_timeout()).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(raw) => {
                    tracker.record_call(raw.to_string().len() as u64);
                    self.emit(
                        context.run_id,
                        EventType::StepCompleted,
                        json!({
                            "step": context.step,
                            "phase": context.phase,
                            "scene": context.scene,
                            "attempt": attempt,
                            "durationMs": duration_ms,
                        }),
                    )
                    .await;
                    return Ok(raw);
                }
                Err(e) => {
                    tracker.record_call(0);
                    if self.retry.allows_retry_after(attempt) {
                        let delay = self.retry.backoff(attempt);
                        warn!(
                            step = %context.step,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    error!(step = %context.step, attempt, error = %e, "Step failed permanently");
                    return Err(e.context(format!(
                        "Step '{}' failed after {} attempts",
                        context.step, attempt
                    )));
                }
            }
        }
    }

    /// Log the facts a step reported and announce them
    async fn record_facts(
        &self,
        state: &mut GenerationState,
        step: StepName,
        output: &StepOutput,
    ) -> usize {
        let scene = state.current_scene;
        let facts: Vec<RawFact> = output
            .facts()
            .iter()
            .map(|fact| RawFact::new(fact.trim(), step, scene))
            .collect();
        if facts.is_empty() {
            return 0;
        }

        let texts: Vec<&str> = facts.iter().map(|f| f.fact.as_str()).collect();
        let payload = json!({
            "scene": scene,
            "step": step,
            "count": facts.len(),
            "facts": texts,
        });

        let count = state.record_facts(facts);
        self.emit(state.run_id, EventType::RawFactsRecorded, payload).await;
        count
    }

    /// Context for one step invocation. Includes run-level artifacts and the
    /// current scene's artifacts (scene prefix stripped).
    fn context(
        &self,
        state: &GenerationState,
        spec: &PhaseSpec,
        step: StepName,
        role: StepRole,
    ) -> StepContext {
        let scene = spec.per_scene.then_some(state.current_scene);
        let scene_prefix = scene.map(|s| format!("scene-{}", s));

        let mut artifacts = BTreeMap::new();
        for (key, artifact) in &state.artifacts {
            match key.split_once('/') {
                None => {
                    artifacts.insert(key.clone(), artifact.content.clone());
                }
                Some((prefix, name)) if Some(prefix) == scene_prefix.as_deref() => {
                    artifacts.insert(name.to_string(), artifact.content.clone());
                }
                Some(_) => {}
            }
        }

        StepContext {
            run_id: state.run_id,
            project_id: state.project_id.clone(),
            step,
            phase: spec.name,
            role,
            expects: expected_output(spec.name, step),
            scene,
            total_scenes: state.total_scenes,
            artifacts,
            draft: scene.and_then(|s| state.drafts.get(&s).cloned()),
            critique_notes: Vec::new(),
            key_constraints: state.key_constraints.clone(),
            world_state: state.world_state.clone(),
            iteration: None,
            repair_feedback: None,
        }
    }

    /// Publish a progress event. A failed append is retried once with the
    /// same event id, then logged. Runs proceed without a log store.
    async fn emit(&self, run_id: Uuid, event_type: EventType, payload: Value) {
        if !self.publisher.is_enabled() {
            return;
        }

        let event = self.publisher.prepare(run_id, event_type, payload);
        if let Err(first) = self.publisher.publish_prepared(&event).await {
            warn!(%run_id, %event_type, error = %first, "Publish failed, retrying");
            if let Err(e) = self.publisher.publish_prepared(&event).await {
                error!(%run_id, %event_type, event_id = %event.event_id, error = %e, "Event dropped");
            }
        }
    }
}

/// `{phase, scene?}` merged with `extra`
fn phase_payload(spec: &PhaseSpec, scene: u32, extra: Value) -> Value {
    let mut payload = json!({"phase": spec.name});
    if spec.per_scene {
        payload["scene"] = json!(scene);
    }
    if let (Value::Object(map), Value::Object(extra)) = (&mut payload, extra) {
        map.extend(extra);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Step;
    use crate::stream::{GatewaySettings, MemoryLogStore, PublisherSettings};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_phase_payload() {
        let payload = phase_payload(phases::spec(PhaseName::Outline), 3, json!({"step": "strategist"}));
        assert_eq!(payload, json!({"phase": "outline", "step": "strategist"}));

        let payload = phase_payload(phases::spec(PhaseName::Drafting), 3, json!({}));
        assert_eq!(payload, json!({"phase": "drafting", "scene": 3}));
    }

    /// Answers every step with valid output of the expected kind
    struct Echo;

    #[async_trait]
    impl Step for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, context: &StepContext, _timeout: Duration) -> anyhow::Result<Value> {
            Ok(match context.expects {
                crate::core::steps::OutputKind::Critique => json!({"kind": "critique", "approved": true}),
                crate::core::steps::OutputKind::Draft => json!({"kind": "draft", "content": "Scene text."}),
                crate::core::steps::OutputKind::Artifact => {
                    json!({"kind": "artifact", "content": format!("{} output", context.step)})
                }
            })
        }
    }

    fn orchestrator(home: &TempDir) -> Orchestrator {
        let echo: Arc<dyn Step> = Arc::new(Echo);
        let mut steps = StepRegistry::new();
        for step in [
            StepName::Architect,
            StepName::Profiler,
            StepName::Worldbuilder,
            StepName::Strategist,
            StepName::Writer,
            StepName::Critic,
            StepName::Archivist,
        ] {
            steps.register(step, echo.clone());
        }

        let store: Arc<dyn crate::stream::LogStore> = Arc::new(MemoryLogStore::new());
        Orchestrator::new(
            steps,
            EventPublisher::new(Some(store.clone()), PublisherSettings::default()),
            EventGateway::new(Some(store), GatewaySettings::default()),
            Arc::new(RunRegistry::new()),
            RecoveryManager::new(home.path().join("runs"), 14),
        )
    }

    #[tokio::test]
    async fn test_stop_after_run_level_phase() {
        let home = TempDir::new().unwrap();
        let orchestrator = orchestrator(&home);

        let mut request = RunRequest::new("p", 2);
        request.stop_after = Some(PhaseName::Outline);
        let started = orchestrator.start(request).await.unwrap();
        let run_id = started.handle.run_id;

        let outcome = started.task.await.unwrap();
        assert_eq!(outcome, RunOutcome::Stopped { phase: PhaseName::Outline });

        let history = orchestrator.gateway().get_history(run_id, 1000).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.event_type, EventType::PhaseComplete);
        assert!(last.is_terminal());
        assert!(orchestrator.registry().get(run_id).await.is_none());
    }

    #[tokio::test]
    async fn test_request_validation() {
        let home = TempDir::new().unwrap();
        let orchestrator = orchestrator(&home);

        assert!(orchestrator.start(RunRequest::new("p", 0)).await.is_err());

        let mut request = RunRequest::new("p", 1);
        request.stop_after = Some(PhaseName::Revision);
        assert!(orchestrator.start(request).await.is_err());
    }

    #[tokio::test]
    async fn test_status_of_unknown_run() {
        let home = TempDir::new().unwrap();
        let orchestrator = orchestrator(&home);
        assert!(orchestrator.status(Uuid::new_v4()).await.unwrap().is_none());
    }
}
