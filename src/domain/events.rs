//! Event types carried by the per-run event log.
//!
//! Every progress notification, fact recording and canonical update is an
//! immutable `StreamEvent`. The log assigns `log_seq`; the publisher assigns
//! `event_id`, the token clients deduplicate on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of an entry in one log. Strictly increasing per log, starting at 1.
///
/// `LogSeq(0)` is never assigned and stands for "before the first entry".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogSeq(pub u64);

impl LogSeq {
    /// The position before any entry
    pub const ORIGIN: LogSeq = LogSeq(0);

    pub fn next(self) -> Self {
        LogSeq(self.0 + 1)
    }
}

impl fmt::Display for LogSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-facing dedup token, independent of the log sequence.
///
/// Format: `{unix_micros}-{8 hex chars}`. Ids sort roughly by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        let micros = Utc::now().timestamp_micros();
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", micros, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single event as observed by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    /// Assigned by the log; absent on synthetic gateway events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_seq: Option<LogSeq>,

    /// Dedup token assigned by the publisher
    pub event_id: EventId,

    /// Kind of event
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Run the event belongs to
    pub run_id: Uuid,

    /// When the event was created
    pub timestamp: DateTime<Utc>,

    /// Event-specific data
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StreamEvent {
    /// Create an event that has not been appended to any log yet
    pub fn new(run_id: Uuid, event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            log_seq: None,
            event_id: EventId::generate(),
            event_type,
            run_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Attach the sequence assigned by the log
    pub fn with_seq(mut self, seq: LogSeq) -> Self {
        self.log_seq = Some(seq);
        self
    }

    /// Whether observing this event ends a live subscription.
    ///
    /// A `phase_complete` event only ends the stream when tagged `final: true`.
    pub fn is_terminal(&self) -> bool {
        match self.event_type {
            EventType::GenerationComplete
            | EventType::GenerationError
            | EventType::GenerationCancelled
            | EventType::GenerationInterrupted => true,
            EventType::PhaseComplete => self
                .payload
                .get("final")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Wire frame sent to live and history clients
    pub fn to_frame(&self) -> StreamFrame {
        StreamFrame {
            id: self.event_id.clone(),
            event_type: self.event_type,
            run_id: self.run_id,
            timestamp: self.timestamp,
            data: self.payload.clone(),
            log_seq: self.log_seq,
        }
    }
}

/// JSON `data` of a transport frame: `{id, type, runId, timestamp, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_seq: Option<LogSeq>,
}

impl From<StreamFrame> for StreamEvent {
    fn from(frame: StreamFrame) -> Self {
        Self {
            log_seq: frame.log_seq,
            event_id: frame.id,
            event_type: frame.event_type,
            run_id: frame.run_id,
            timestamp: frame.timestamp,
            payload: frame.data,
        }
    }
}

/// Types of events that flow through a run's log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Synthetic gateway events
    /// Subscription opened
    Connected,
    /// No real event within the heartbeat interval
    Heartbeat,
    /// Last frame before the gateway closes a subscription
    StreamEnd,
    /// Transient read failure (subscription stays open)
    Error,

    // Run lifecycle
    GenerationStarted,
    GenerationPaused,
    GenerationResumed,
    GenerationCancelled,
    GenerationComplete,
    GenerationError,
    /// The process stopped while the run was in flight; a snapshot may be resumable
    GenerationInterrupted,

    // Phase lifecycle
    PhaseStart,
    PhaseComplete,
    StepStarted,
    StepCompleted,
    /// A step's output failed validation and is being repaired
    StepRepairing,

    // Scene progress
    DraftProduced,
    CritiqueProduced,
    RevisionLimitReached,

    // Continuity
    RawFactsRecorded,
    ConstraintsUpdated,
    WorldStateUpdated,
}

impl EventType {
    /// Name used for the SSE `event:` field
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::Heartbeat => "heartbeat",
            EventType::StreamEnd => "stream_end",
            EventType::Error => "error",
            EventType::GenerationStarted => "generation_started",
            EventType::GenerationPaused => "generation_paused",
            EventType::GenerationResumed => "generation_resumed",
            EventType::GenerationCancelled => "generation_cancelled",
            EventType::GenerationComplete => "generation_complete",
            EventType::GenerationError => "generation_error",
            EventType::GenerationInterrupted => "generation_interrupted",
            EventType::PhaseStart => "phase_start",
            EventType::PhaseComplete => "phase_complete",
            EventType::StepStarted => "step_started",
            EventType::StepCompleted => "step_completed",
            EventType::StepRepairing => "step_repairing",
            EventType::DraftProduced => "draft_produced",
            EventType::CritiqueProduced => "critique_produced",
            EventType::RevisionLimitReached => "revision_limit_reached",
            EventType::RawFactsRecorded => "raw_facts_recorded",
            EventType::ConstraintsUpdated => "constraints_updated",
            EventType::WorldStateUpdated => "world_state_updated",
        }
    }

    /// Gateway-generated types that never enter a log
    pub fn is_synthetic(&self) -> bool {
        matches!(
            self,
            EventType::Connected | EventType::Heartbeat | EventType::StreamEnd | EventType::Error
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
