//! Streaming gateway: fans one run's log out to independent live subscriptions.
//!
//! Each subscription owns its own `LogReader`, so a slow or blocked client
//! never delays another client or the run's writer.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{EventType, LogSeq, StreamEvent};

use super::publisher::{decode_entry, run_log_key};
use super::store::{LogStore, StoreError};

/// A live subscription. Dropping it ends the subscription within one poll interval.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Errors raised when opening a subscription or reading history
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Event gateway is disabled: no log store configured")]
    Disabled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a subscription starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// Only events appended after the subscription opens
    #[default]
    Latest,
    /// Every retained event with a greater sequence (`LogSeq::ORIGIN` = all)
    After(LogSeq),
}

/// Timing and size knobs for the gateway
#[derive(Debug, Clone, Copy)]
pub struct GatewaySettings {
    pub heartbeat: Duration,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub history_limit: usize,
    /// Entries fetched per tail-follow read
    pub batch_size: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            poll_interval: Duration::from_secs(2),
            error_backoff: Duration::from_secs(1),
            history_limit: 1000,
            batch_size: 100,
        }
    }
}

/// Connectivity report for the health endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Unavailable,
    Disabled,
}

/// Read side of the event log
#[derive(Clone)]
pub struct EventGateway {
    store: Option<Arc<dyn LogStore>>,
    settings: GatewaySettings,
}

impl EventGateway {
    pub fn new(store: Option<Arc<dyn LogStore>>, settings: GatewaySettings) -> Self {
        Self { store, settings }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn settings(&self) -> GatewaySettings {
        self.settings
    }

    fn store(&self) -> Result<&Arc<dyn LogStore>, GatewayError> {
        self.store.as_ref().ok_or(GatewayError::Disabled)
    }

    pub async fn health(&self) -> GatewayHealth {
        let Some(store) = &self.store else {
            return GatewayHealth {
                status: HealthStatus::Disabled,
                backend: None,
                error: None,
            };
        };

        match store.ping().await {
            Ok(()) => GatewayHealth {
                status: HealthStatus::Ok,
                backend: Some(store.name().to_string()),
                error: None,
            },
            Err(err) => GatewayHealth {
                status: HealthStatus::Unavailable,
                backend: Some(store.name().to_string()),
                error: Some(err.to_string()),
            },
        }
    }

    /// Open a live subscription to a run's log.
    ///
    /// The stream starts with `connected`, emits `heartbeat` when idle, and
    /// closes with `stream_end` right after a terminal event. An offset past
    /// the log's last sequence is treated as stale and replays from the start.
    pub async fn subscribe(&self, run_id: Uuid, from: StartFrom) -> Result<EventStream, GatewayError> {
        let store = self.store()?;
        let key = run_log_key(run_id);

        let last = store.last_seq(&key).await?;
        let (start, reset) = match from {
            StartFrom::Latest => (last, false),
            // An offset the log never reached came from an earlier log
            // (e.g. a memory store before a restart)
            StartFrom::After(seq) if seq > last => {
                warn!(%run_id, requested = %seq, last = %last, "Offset is past the end of the log, replaying from the start");
                (LogSeq::ORIGIN, true)
            }
            StartFrom::After(seq) => (seq, false),
        };
        let mut reader = store.open_reader().await?;
        let settings = self.settings;

        debug!(%run_id, from = %start, "Opened subscription");

        let stream = async_stream::stream! {
            yield synthetic(run_id, EventType::Connected, json!({ "from": start, "reset": reset }));

            let mut cursor = start;
            let mut last_emit = Instant::now();

            loop {
                let until_heartbeat = settings.heartbeat.saturating_sub(last_emit.elapsed());
                let block = settings.poll_interval.min(until_heartbeat);

                match reader.read_after(&key, cursor, settings.batch_size, block).await {
                    Ok(entries) => {
                        for entry in entries {
                            cursor = entry.seq;
                            match decode_entry(&entry) {
                                Ok(event) => {
                                    let terminal = event.is_terminal();
                                    let event_type = event.event_type;
                                    yield event;
                                    last_emit = Instant::now();

                                    if terminal {
                                        debug!(%run_id, %event_type, "Closing subscription after terminal event");
                                        yield synthetic(
                                            run_id,
                                            EventType::StreamEnd,
                                            json!({ "reason": event_type }),
                                        );
                                        return;
                                    }
                                }
                                Err(err) => {
                                    warn!(%run_id, seq = %entry.seq, error = %err, "Skipping undecodable entry");
                                    yield synthetic(
                                        run_id,
                                        EventType::Error,
                                        json!({ "message": err.to_string(), "logSeq": entry.seq }),
                                    );
                                    last_emit = Instant::now();
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%run_id, error = %err, "Log read failed, backing off");
                        yield synthetic(
                            run_id,
                            EventType::Error,
                            json!({
                                "message": err.to_string(),
                                "retryInMs": settings.error_backoff.as_millis() as u64,
                            }),
                        );
                        last_emit = Instant::now();
                        tokio::time::sleep(settings.error_backoff).await;
                        continue;
                    }
                }

                if last_emit.elapsed() >= settings.heartbeat {
                    yield synthetic(run_id, EventType::Heartbeat, json!({}));
                    last_emit = Instant::now();
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// The most recent `min(count, history_limit)` events, oldest first
    pub async fn get_history(&self, run_id: Uuid, count: usize) -> Result<Vec<StreamEvent>, GatewayError> {
        let store = self.store()?;
        let count = count.min(self.settings.history_limit);
        if count == 0 {
            return Ok(Vec::new());
        }

        let entries = store.tail(&run_log_key(run_id), count).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| match decode_entry(entry) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(%run_id, seq = %entry.seq, error = %err, "Skipping undecodable entry");
                    None
                }
            })
            .collect())
    }
}

fn synthetic(run_id: Uuid, event_type: EventType, payload: serde_json::Value) -> StreamEvent {
    StreamEvent::new(run_id, event_type, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::publisher::{EventPublisher, PublisherSettings};
    use crate::stream::store::MemoryLogStore;
    use futures::StreamExt;

    fn fast_settings() -> GatewaySettings {
        GatewaySettings {
            heartbeat: Duration::from_millis(60),
            poll_interval: Duration::from_millis(20),
            error_backoff: Duration::from_millis(20),
            history_limit: 1000,
            batch_size: 100,
        }
    }

    fn setup() -> (MemoryLogStore, EventPublisher, EventGateway) {
        let store = MemoryLogStore::new();
        let shared: Arc<dyn LogStore> = Arc::new(store.clone());
        let publisher = EventPublisher::new(Some(Arc::clone(&shared)), PublisherSettings::default());
        let gateway = EventGateway::new(Some(shared), fast_settings());
        (store, publisher, gateway)
    }

    async fn next(stream: &mut EventStream) -> Option<StreamEvent> {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("stream stalled")
    }

    #[tokio::test]
    async fn test_connected_comes_first() {
        let (_store, _publisher, gateway) = setup();
        let mut stream = gateway.subscribe(Uuid::new_v4(), StartFrom::Latest).await.unwrap();
        let first = next(&mut stream).await.unwrap();
        assert_eq!(first.event_type, EventType::Connected);
        assert!(first.log_seq.is_none());
    }

    #[tokio::test]
    async fn test_terminal_event_ends_stream() {
        let (_store, publisher, gateway) = setup();
        let run_id = Uuid::new_v4();
        publisher.publish(run_id, EventType::PhaseStart, json!({"phase": "premise"})).await.unwrap();
        publisher.publish(run_id, EventType::GenerationComplete, json!({})).await.unwrap();

        let mut stream = gateway
            .subscribe(run_id, StartFrom::After(LogSeq::ORIGIN))
            .await
            .unwrap();

        let types: Vec<EventType> = {
            let mut types = Vec::new();
            while let Some(event) = next(&mut stream).await {
                types.push(event.event_type);
            }
            types
        };
        assert_eq!(
            types,
            vec![
                EventType::Connected,
                EventType::PhaseStart,
                EventType::GenerationComplete,
                EventType::StreamEnd,
            ]
        );
    }

    #[tokio::test]
    async fn test_heartbeat_when_idle() {
        let (_store, _publisher, gateway) = setup();
        let mut stream = gateway.subscribe(Uuid::new_v4(), StartFrom::Latest).await.unwrap();
        next(&mut stream).await.unwrap();

        let second = next(&mut stream).await.unwrap();
        assert_eq!(second.event_type, EventType::Heartbeat);
    }

    #[tokio::test]
    async fn test_read_error_is_visible_and_retried() {
        let (store, publisher, gateway) = setup();
        let run_id = Uuid::new_v4();
        let mut stream = gateway.subscribe(run_id, StartFrom::Latest).await.unwrap();
        next(&mut stream).await.unwrap();

        store.simulate_outage(true);
        let error = next(&mut stream).await.unwrap();
        assert_eq!(error.event_type, EventType::Error);

        store.simulate_outage(false);
        publisher.publish(run_id, EventType::GenerationCancelled, json!({})).await.unwrap();

        let mut seen = Vec::new();
        while let Some(event) = next(&mut stream).await {
            if event.event_type != EventType::Error && event.event_type != EventType::Heartbeat {
                seen.push(event.event_type);
            }
        }
        assert_eq!(seen, vec![EventType::GenerationCancelled, EventType::StreamEnd]);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_ascending() {
        let (_store, publisher, gateway) = setup();
        let run_id = Uuid::new_v4();
        for scene in 1..=5 {
            publisher.publish(run_id, EventType::DraftProduced, json!({"scene": scene})).await.unwrap();
        }

        let history = gateway.get_history(run_id, 3).await.unwrap();
        let scenes: Vec<u64> = history
            .iter()
            .map(|e| e.payload["scene"].as_u64().unwrap())
            .collect();
        assert_eq!(scenes, vec![3, 4, 5]);
        assert!(gateway.get_history(run_id, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_gateway() {
        let gateway = EventGateway::new(None, fast_settings());
        assert!(matches!(
            gateway.subscribe(Uuid::new_v4(), StartFrom::Latest).await,
            Err(GatewayError::Disabled)
        ));
        assert_eq!(gateway.health().await.status, HealthStatus::Disabled);
    }
}
