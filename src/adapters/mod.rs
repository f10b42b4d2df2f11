//! Step implementations.
//!
//! A step is one agent of the pipeline (architect, writer, critic, ...).
//! Prompting and model calls live outside this crate; a step only has to
//! turn a `StepContext` into JSON.

pub mod command;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::steps::StepContext;

pub use command::CommandStep;

/// Capability interface for pipeline steps
#[async_trait]
pub trait Step: Send + Sync {
    /// Human-readable implementation name
    fn name(&self) -> &str;

    /// Produce raw JSON output for `context`. Decoding and validation
    /// happen in the orchestrator.
    async fn execute(&self, context: &StepContext, timeout: Duration) -> Result<serde_json::Value>;
}
