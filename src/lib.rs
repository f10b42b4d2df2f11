//! chronicle - Multi-agent story generation orchestrator
//!
//! Drives a run through a fixed table of phases, each executed by one or
//! more agent steps, and publishes every state change to a per-run event
//! log that clients follow over Server-Sent Events.
//!
//! # Architecture
//!
//! - Each run has exactly one writer task; everything else observes it
//!   through the event log
//! - Live subscribers resume from a log sequence and receive events at
//!   least once, deduplicating by event id
//! - Interrupted runs are snapshotted at phase boundaries and can be
//!   resumed from the last checkpoint
//!
//! # Modules
//!
//! - `adapters`: Step implementations (external commands)
//! - `core`: Orchestration (phases, validation, continuity, recovery)
//! - `domain`: Data structures (events, facts, world state, run state)
//! - `stream`: Event log, publisher, gateway and lag monitoring
//! - `server`: HTTP surface
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Serve the event stream and run control API
//! CHRONICLE_LOG_URL=memory:// chronicle serve
//!
//! # Run a generation in process and print its events
//! CHRONICLE_LOG_URL=memory:// chronicle generate --project demo --scenes 2 --follow
//!
//! # Resume an interrupted run
//! chronicle resume <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod server;
pub mod stream;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, RunOutcome, RunRequest};
pub use domain::{EventType, GenerationState, PhaseName, StreamEvent};
pub use stream::{EventGateway, EventPublisher};
