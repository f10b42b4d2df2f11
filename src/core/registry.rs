//! Registry of live runs and their control handles.
//!
//! Each run has exactly one writer. The registry refuses a second `create`
//! for a run that is still registered.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;

use crate::domain::{GenerationState, PhaseName};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Run {0} already has an active writer")]
    AlreadyActive(Uuid),

    #[error("Run {0} is not registered")]
    NotFound(Uuid),
}

/// Control state observed by a run at its checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Running,
    Paused,
    /// Sticky: a cancelled run never resumes
    Cancelled,
}

/// Pause/resume/cancel switch plus the last checkpointed state of one run
#[derive(Debug)]
pub struct RunControl {
    signal: watch::Sender<ControlSignal>,
    checkpoint: Mutex<Option<GenerationState>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(ControlSignal::Running);
        Self {
            signal,
            checkpoint: Mutex::new(None),
        }
    }

    pub fn signal(&self) -> ControlSignal {
        *self.signal.borrow()
    }

    /// Request a pause at the next phase boundary. Returns false if not running.
    pub fn pause(&self) -> bool {
        self.signal.send_if_modified(|s| {
            if *s == ControlSignal::Running {
                *s = ControlSignal::Paused;
                true
            } else {
                false
            }
        })
    }

    /// Returns false if the run was not paused
    pub fn resume(&self) -> bool {
        self.signal.send_if_modified(|s| {
            if *s == ControlSignal::Paused {
                *s = ControlSignal::Running;
                true
            } else {
                false
            }
        })
    }

    /// Returns false if already cancelled
    pub fn cancel(&self) -> bool {
        self.signal.send_if_modified(|s| {
            if *s != ControlSignal::Cancelled {
                *s = ControlSignal::Cancelled;
                true
            } else {
                false
            }
        })
    }

    /// Block while paused. Returns the signal that ended the wait
    /// (`Running` or `Cancelled`).
    pub async fn wait_while_paused(&self) -> ControlSignal {
        let mut rx = self.signal.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current != ControlSignal::Paused {
                return current;
            }
            if rx.changed().await.is_err() {
                return ControlSignal::Cancelled;
            }
        }
    }

    pub async fn save_checkpoint(&self, state: &GenerationState) {
        *self.checkpoint.lock().await = Some(state.clone());
    }

    pub async fn last_checkpoint(&self) -> Option<GenerationState> {
        self.checkpoint.lock().await.clone()
    }
}

/// A registered run
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub project_id: String,
    pub control: Arc<RunControl>,
    pub registered_at: DateTime<Utc>,
}

/// Listing entry for a registered run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub project_id: String,
    pub signal: ControlSignal,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_scene: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_phase: Option<PhaseName>,
}

/// Live runs by id
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<Uuid, RunHandle>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a writer for a run
    pub async fn create(&self, run_id: Uuid, project_id: &str) -> Result<RunHandle, RegistryError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run_id) {
            return Err(RegistryError::AlreadyActive(run_id));
        }

        let handle = RunHandle {
            run_id,
            project_id: project_id.to_string(),
            control: Arc::new(RunControl::new()),
            registered_at: Utc::now(),
        };
        runs.insert(run_id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, run_id: Uuid) -> Option<RunHandle> {
        self.runs.read().await.get(&run_id).cloned()
    }

    pub async fn control(&self, run_id: Uuid) -> Result<Arc<RunControl>, RegistryError> {
        self.get(run_id)
            .await
            .map(|h| h.control)
            .ok_or(RegistryError::NotFound(run_id))
    }

    /// Remove a run; returns its handle if it was registered
    pub async fn destroy(&self, run_id: Uuid) -> Option<RunHandle> {
        self.runs.write().await.remove(&run_id)
    }

    pub async fn handles(&self) -> Vec<RunHandle> {
        self.runs.read().await.values().cloned().collect()
    }

    pub async fn list(&self) -> Vec<RunSummary> {
        let mut summaries = Vec::new();
        for handle in self.handles().await {
            let checkpoint = handle.control.last_checkpoint().await.map(|s| s.checkpoint());
            summaries.push(RunSummary {
                run_id: handle.run_id,
                project_id: handle.project_id.clone(),
                signal: handle.control.signal(),
                registered_at: handle.registered_at,
                checkpoint_scene: checkpoint.map(|(scene, _)| scene),
                checkpoint_phase: checkpoint.map(|(_, phase)| phase),
            });
        }
        summaries.sort_by_key(|s| s.registered_at);
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_writer_is_refused() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();
        registry.create(run_id, "p").await.unwrap();

        assert!(matches!(
            registry.create(run_id, "p").await,
            Err(RegistryError::AlreadyActive(id)) if id == run_id
        ));

        registry.destroy(run_id).await.unwrap();
        assert!(registry.create(run_id, "p").await.is_ok());
    }

    #[tokio::test]
    async fn test_pause_resume_cancel_transitions() {
        let control = RunControl::new();
        assert!(control.pause());
        assert!(!control.pause());
        assert!(control.resume());
        assert!(!control.resume());
        assert!(control.cancel());
        assert!(!control.pause());
        assert!(!control.resume());
        assert_eq!(control.signal(), ControlSignal::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_while_paused_wakes_on_resume() {
        let control = Arc::new(RunControl::new());
        control.pause();

        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.resume();
        let signal = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, ControlSignal::Running);
    }

    #[test]
    fn test_wait_while_paused_is_pending_until_resume() {
        let control = RunControl::new();
        control.pause();

        let mut wait = tokio_test::task::spawn(control.wait_while_paused());
        tokio_test::assert_pending!(wait.poll());

        control.resume();
        assert!(wait.is_woken());
        assert_eq!(tokio_test::assert_ready!(wait.poll()), ControlSignal::Running);
    }

    #[tokio::test]
    async fn test_cancel_releases_paused_run() {
        let control = Arc::new(RunControl::new());
        control.pause();

        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        control.cancel();
        let signal = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, ControlSignal::Cancelled);
    }

    #[tokio::test]
    async fn test_list_reports_checkpoints() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();
        let handle = registry.create(run_id, "p").await.unwrap();

        let mut state = GenerationState::new(run_id, "p", 3);
        state.current_scene = 2;
        state.phase = PhaseName::Revision;
        handle.control.save_checkpoint(&state).await;

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].checkpoint_scene, Some(2));
        assert_eq!(list[0].checkpoint_phase, Some(PhaseName::Revision));
    }
}
