//! Core orchestration logic.
//!
//! This module contains:
//! - Phases: Phase table, transitions and retry policy
//! - Steps: Step context, outputs and dispatch
//! - Limits: Generation limits and enforcement
//! - Continuity: Raw facts to constraints and world-state diffs
//! - Validation: Output checks and the repair rule
//! - Registry: Live runs and their control handles
//! - Recovery: Snapshots of interrupted runs
//! - Orchestrator: Main execution engine

pub mod continuity;
pub mod limits;
pub mod orchestrator;
pub mod phases;
pub mod recovery;
pub mod registry;
pub mod steps;
pub mod validation;

// Re-export commonly used types
pub use continuity::{ContinuityEngine, ContinuityOutcome, FactInterpreter, Observation, PatternInterpreter};
pub use limits::{GenerationLimits, LimitTracker, LimitViolation};
pub use orchestrator::{Orchestrator, RunOutcome, RunRequest, RunStatusView, StartedRun};
pub use phases::{PhaseSpec, RetryPolicy, PHASES};
pub use recovery::{RecoveryError, RecoveryManager, RunSnapshot, SnapshotInfo};
pub use registry::{ControlSignal, RegistryError, RunControl, RunHandle, RunRegistry, RunSummary};
pub use steps::{OutputKind, StepContext, StepOutput, StepRegistry, StepRole};
pub use validation::ValidationError;
