//! Domain types for the chronicle orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records in a run's log
//! - Facts: Raw facts and key constraints
//! - World: Canonical world state and diffs
//! - State: Generation state owned by a run's writer
//! - Progress: Run progress reconstructed from events
//! - Artifact: Phase outputs

pub mod artifact;
pub mod events;
pub mod facts;
pub mod progress;
pub mod state;
pub mod world;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactKind};
pub use events::{EventId, EventType, LogSeq, StreamEvent, StreamFrame};
pub use facts::{resolve_constraints, DiscardReason, DiscardedFact, KeyConstraint, RawFact, StepName};
pub use progress::{RunProgress, RunStatus};
pub use state::{Critique, GenerationState, PhaseName};
pub use world::{
    CharacterState, CharacterStatus, CharacterUpdate, LocationState, OrganizationState,
    Significance, TimelineFact, WorldState, WorldStateDiff,
};
