//! Event publisher: the single writer of a run's log.
//!
//! Every published event lands in the run's own log and in the global
//! monitoring log. Both are bounded by approximate trimming.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{EventId, EventType, LogSeq, StreamEvent};

use super::store::{LogEntry, LogStore, StoreError};

/// Key of the cross-run monitoring log
pub const GLOBAL_LOG: &str = "events:global";

/// Key of a run's log
pub fn run_log_key(run_id: Uuid) -> String {
    format!("run:{}:events", run_id)
}

/// Decode a stored entry, attaching the sequence the log assigned
pub fn decode_entry(entry: &LogEntry) -> Result<StreamEvent, serde_json::Error> {
    let event: StreamEvent = serde_json::from_str(&entry.body)?;
    Ok(event.with_seq(entry.seq))
}

/// Errors raised when publishing
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Event gateway is disabled: no log store configured")]
    Disabled,

    #[error("Failed to append to '{key}': {source}")]
    Append {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Synthetic event type '{0}' cannot be published")]
    Synthetic(EventType),
}

/// Retention limits for published logs
#[derive(Debug, Clone, Copy)]
pub struct PublisherSettings {
    pub run_max_len: usize,
    pub global_max_len: usize,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            run_max_len: 1000,
            global_max_len: 10_000,
        }
    }
}

/// Appends typed events to run logs and the global log
#[derive(Clone)]
pub struct EventPublisher {
    store: Option<Arc<dyn LogStore>>,
    settings: PublisherSettings,
}

impl EventPublisher {
    /// A publisher without a store fails every publish (fails closed)
    pub fn new(store: Option<Arc<dyn LogStore>>, settings: PublisherSettings) -> Self {
        Self { store, settings }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn settings(&self) -> PublisherSettings {
        self.settings
    }

    /// Build an event with a fresh id without publishing it.
    ///
    /// Publishing the same prepared event again (a retry) keeps its id, so
    /// clients can drop the duplicate.
    pub fn prepare(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> StreamEvent {
        StreamEvent::new(run_id, event_type, payload)
    }

    /// Publish a new event and return its id
    pub async fn publish(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<EventId, PublishError> {
        let event = self.prepare(run_id, event_type, payload);
        self.publish_prepared(&event).await?;
        Ok(event.event_id)
    }

    /// Append a prepared event to its run log and to the global log.
    /// Returns the run log sequence.
    pub async fn publish_prepared(&self, event: &StreamEvent) -> Result<LogSeq, PublishError> {
        let store = self.store.as_ref().ok_or(PublishError::Disabled)?;
        if event.event_type.is_synthetic() {
            return Err(PublishError::Synthetic(event.event_type));
        }

        let mut stored = event.clone();
        stored.log_seq = None;
        let body = serde_json::to_string(&stored)?;

        let key = run_log_key(event.run_id);
        let seq = store
            .append(&key, body.clone(), self.settings.run_max_len)
            .await
            .map_err(|source| PublishError::Append {
                key: key.clone(),
                source,
            })?;

        if let Err(source) = store
            .append(GLOBAL_LOG, body, self.settings.global_max_len)
            .await
        {
            warn!(run_id = %event.run_id, error = %source, "Global log append failed");
            return Err(PublishError::Append {
                key: GLOBAL_LOG.to_string(),
                source,
            });
        }

        debug!(
            run_id = %event.run_id,
            event_type = %event.event_type,
            event_id = %event.event_id,
            %seq,
            "Published event"
        );
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::store::MemoryLogStore;
    use serde_json::json;

    fn publisher(store: &MemoryLogStore) -> EventPublisher {
        EventPublisher::new(
            Some(Arc::new(store.clone()) as Arc<dyn LogStore>),
            PublisherSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_publish_writes_run_and_global_logs() {
        let store = MemoryLogStore::new();
        let publisher = publisher(&store);
        let run_id = Uuid::new_v4();

        let id = publisher
            .publish(run_id, EventType::PhaseStart, json!({"phase": "premise"}))
            .await
            .unwrap();

        let run_entries = store.range(&run_log_key(run_id), LogSeq::ORIGIN, 10).await.unwrap();
        assert_eq!(run_entries.len(), 1);
        let event = decode_entry(&run_entries[0]).unwrap();
        assert_eq!(event.event_id, id);
        assert_eq!(event.log_seq, Some(LogSeq(1)));
        assert_eq!(store.len(GLOBAL_LOG).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_republish_prepared_keeps_id() {
        let store = MemoryLogStore::new();
        let publisher = publisher(&store);
        let run_id = Uuid::new_v4();

        let event = publisher.prepare(run_id, EventType::DraftProduced, json!({"scene": 1}));
        let first = publisher.publish_prepared(&event).await.unwrap();
        let second = publisher.publish_prepared(&event).await.unwrap();
        assert!(second > first);

        let entries = store.range(&run_log_key(run_id), LogSeq::ORIGIN, 10).await.unwrap();
        let ids: Vec<EventId> = entries
            .iter()
            .map(|e| decode_entry(e).unwrap().event_id)
            .collect();
        assert_eq!(ids[0], ids[1]);

        // Same content, new publish: new id
        let fresh = publisher
            .publish(run_id, EventType::DraftProduced, json!({"scene": 1}))
            .await
            .unwrap();
        assert_ne!(fresh, ids[0]);
    }

    #[tokio::test]
    async fn test_disabled_publisher_fails_closed() {
        let publisher = EventPublisher::new(None, PublisherSettings::default());
        let result = publisher
            .publish(Uuid::new_v4(), EventType::GenerationStarted, json!({}))
            .await;
        assert!(matches!(result, Err(PublishError::Disabled)));
    }

    #[tokio::test]
    async fn test_append_failure_is_loud() {
        let store = MemoryLogStore::new();
        let publisher = publisher(&store);
        store.simulate_outage(true);

        let result = publisher
            .publish(Uuid::new_v4(), EventType::GenerationStarted, json!({}))
            .await;
        assert!(matches!(result, Err(PublishError::Append { .. })));
    }

    #[tokio::test]
    async fn test_synthetic_types_are_rejected() {
        let store = MemoryLogStore::new();
        let publisher = publisher(&store);
        let result = publisher
            .publish(Uuid::new_v4(), EventType::Heartbeat, json!({}))
            .await;
        assert!(matches!(result, Err(PublishError::Synthetic(EventType::Heartbeat))));
    }
}
