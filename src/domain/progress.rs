//! Observer-side run progress reconstructed from a run's event log.
//!
//! Subscribers never see `GenerationState`; they see events. Replaying the
//! log in order yields the same view for every observer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{EventType, LogSeq, StreamEvent};
use super::state::PhaseName;

/// A run as seen through its event log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub phase: Option<PhaseName>,
    pub scene: Option<u32>,
    pub total_scenes: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Highest log position applied
    pub last_seq: Option<LogSeq>,
    pub events_applied: usize,
}

impl RunProgress {
    /// Reconstruct progress from a sequence of events
    pub fn from_events(events: &[StreamEvent]) -> Option<Self> {
        let first = events.first()?;

        let mut progress = Self {
            run_id: first.run_id,
            status: RunStatus::Pending,
            phase: None,
            scene: None,
            total_scenes: None,
            started_at: first.timestamp,
            finished_at: None,
            last_seq: None,
            events_applied: 0,
        };

        for event in events {
            progress.apply_event(event);
        }

        Some(progress)
    }

    /// Apply a single event. Synthetic events and already-applied log
    /// positions are ignored, so replays after a reconnect are harmless.
    pub fn apply_event(&mut self, event: &StreamEvent) {
        if event.event_type.is_synthetic() {
            return;
        }
        if let (Some(seq), Some(last)) = (event.log_seq, self.last_seq) {
            if seq <= last {
                return;
            }
        }
        if event.log_seq.is_some() {
            self.last_seq = event.log_seq;
        }
        self.events_applied += 1;

        let payload = &event.payload;
        if let Some(scene) = payload.get("scene").and_then(|v| v.as_u64()) {
            self.scene = Some(scene as u32);
        }

        match event.event_type {
            EventType::GenerationStarted => {
                self.status = RunStatus::Running;
                self.started_at = event.timestamp;
                self.total_scenes = payload
                    .get("totalScenes")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as u32);
            }
            EventType::PhaseStart => {
                self.status = RunStatus::Running;
                self.phase = payload
                    .get("phase")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
            }
            EventType::GenerationPaused => self.status = RunStatus::Paused,
            EventType::GenerationResumed => self.status = RunStatus::Running,
            EventType::GenerationComplete => {
                self.status = RunStatus::Completed;
                self.finished_at = Some(event.timestamp);
            }
            EventType::GenerationError => {
                self.status = RunStatus::Failed {
                    error: payload
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                };
                self.finished_at = Some(event.timestamp);
            }
            EventType::GenerationCancelled => {
                self.status = RunStatus::Cancelled;
                self.finished_at = Some(event.timestamp);
            }
            EventType::GenerationInterrupted => {
                self.status = RunStatus::Interrupted {
                    resumable: payload
                        .get("resumable")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                };
            }
            _ => {}
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Completed | RunStatus::Failed { .. } | RunStatus::Cancelled
        )
    }
}

/// Status of a run as observed from its events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    /// Events exist but the run has not announced its start
    Pending,
    Running,
    Paused,
    Completed,
    Failed { error: String },
    Cancelled,
    /// The process stopped mid-run
    Interrupted { resumable: bool },
}
