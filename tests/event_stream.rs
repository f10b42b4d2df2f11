//! Event Stream Integration Tests
//!
//! Publisher and gateway over one log store: resume offsets, stale offsets
//! after a restart, at-least-once replay with client-side dedup, bounded
//! history, run isolation and the global log.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use uuid::Uuid;

use chronicle::domain::{EventType, LogSeq, StreamEvent};
use chronicle::stream::{
    run_log_key, EventBuffer, EventGateway, EventPublisher, EventStream, FileLogStore,
    GatewaySettings, GroupStart, LagMonitor, LogStore, MemoryLogStore, MonitorSettings,
    PublisherSettings, StartFrom, GLOBAL_LOG,
};
use tempfile::TempDir;

fn setup() -> (Arc<dyn LogStore>, EventPublisher, EventGateway) {
    setup_with(Arc::new(MemoryLogStore::new()))
}

fn setup_with(store: Arc<dyn LogStore>) -> (Arc<dyn LogStore>, EventPublisher, EventGateway) {
    let publisher = EventPublisher::new(Some(store.clone()), PublisherSettings::default());
    let gateway = EventGateway::new(
        Some(store.clone()),
        GatewaySettings {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
    );
    (store, publisher, gateway)
}

async fn publish_scenes(publisher: &EventPublisher, run_id: Uuid, scenes: std::ops::Range<u32>) {
    for scene in scenes {
        publisher
            .publish(run_id, EventType::DraftProduced, json!({"scene": scene}))
            .await
            .unwrap();
    }
}

/// Collect until the stream closes, bounded in time
async fn drain(stream: EventStream) -> Vec<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not close")
}

fn real(events: &[StreamEvent]) -> Vec<&StreamEvent> {
    events.iter().filter(|e| e.log_seq.is_some()).collect()
}

#[tokio::test]
async fn test_offset_is_exclusive() {
    let (_store, publisher, gateway) = setup();
    let run_id = Uuid::new_v4();
    publish_scenes(&publisher, run_id, 1..5).await;
    publisher
        .publish(run_id, EventType::GenerationComplete, json!({}))
        .await
        .unwrap();

    let events = drain(gateway.subscribe(run_id, StartFrom::After(LogSeq(2))).await.unwrap()).await;

    assert_eq!(events.first().unwrap().event_type, EventType::Connected);
    assert_eq!(events.first().unwrap().payload["from"], 2);
    let seqs: Vec<u64> = real(&events).iter().map(|e| e.log_seq.unwrap().0).collect();
    assert_eq!(seqs, vec![3, 4, 5]);
    assert_eq!(events.last().unwrap().event_type, EventType::StreamEnd);
    assert_eq!(events.last().unwrap().payload["reason"], "generation_complete");
}

#[tokio::test]
async fn test_offset_past_the_log_replays_from_start() {
    // A fresh in-process log: the client's offset came from before a restart
    let (_store, publisher, gateway) = setup();
    let run_id = Uuid::new_v4();
    publisher
        .publish(run_id, EventType::GenerationInterrupted, json!({"reason": "restart"}))
        .await
        .unwrap();

    let events = drain(gateway.subscribe(run_id, StartFrom::After(LogSeq(40))).await.unwrap()).await;

    let connected = &events[0];
    assert_eq!(connected.event_type, EventType::Connected);
    assert_eq!(connected.payload["from"], 0);
    assert_eq!(connected.payload["reset"], true);

    let types: Vec<EventType> = events[1..].iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![EventType::GenerationInterrupted, EventType::StreamEnd]);
    assert_eq!(events[1].log_seq, Some(LogSeq(1)));
}

#[tokio::test]
async fn test_file_store_keeps_offsets_across_restart() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    {
        let (_store, publisher, _gateway) = setup_with(Arc::new(FileLogStore::open(temp.path()).unwrap()));
        publish_scenes(&publisher, run_id, 1..41).await;
    }

    let (store, publisher, gateway) = setup_with(Arc::new(FileLogStore::open(temp.path()).unwrap()));
    assert_eq!(store.last_seq(&run_log_key(run_id)).await.unwrap(), LogSeq(40));

    publisher
        .publish(run_id, EventType::GenerationInterrupted, json!({"reason": "restart"}))
        .await
        .unwrap();

    // A client that saw seq 40 before the restart resumes right after it
    let events = drain(gateway.subscribe(run_id, StartFrom::After(LogSeq(40))).await.unwrap()).await;
    assert_eq!(events[0].payload["reset"], false);
    let delivered = real(&events);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].event_type, EventType::GenerationInterrupted);
    assert_eq!(delivered[0].log_seq, Some(LogSeq(41)));

    let history = gateway.get_history(run_id, 100).await.unwrap();
    assert_eq!(history.len(), 41);
    assert_eq!(history[0].payload["scene"], 1);
}

#[tokio::test]
async fn test_long_run_history_is_bounded() {
    let (store, publisher, gateway) = setup();
    let run_id = Uuid::new_v4();
    publisher
        .publish(run_id, EventType::GenerationStarted, json!({}))
        .await
        .unwrap();
    publish_scenes(&publisher, run_id, 0..1100).await;

    let key = run_log_key(run_id);
    assert_eq!(store.last_seq(&key).await.unwrap(), LogSeq(1101));
    assert_eq!(store.len(&key).await.unwrap(), 1000);

    let history = gateway.get_history(run_id, 5000).await.unwrap();
    assert_eq!(history.len(), 1000);
    assert!(history[0].log_seq.unwrap() > LogSeq(1));
    assert_eq!(history.last().unwrap().log_seq, Some(LogSeq(1101)));
    assert!(history.windows(2).all(|w| w[0].log_seq < w[1].log_seq));
}

#[tokio::test]
async fn test_latest_skips_existing_events() {
    let (_store, publisher, gateway) = setup();
    let run_id = Uuid::new_v4();
    publish_scenes(&publisher, run_id, 1..4).await;

    let stream = gateway.subscribe(run_id, StartFrom::Latest).await.unwrap();
    publisher
        .publish(run_id, EventType::GenerationCancelled, json!({"scene": 3}))
        .await
        .unwrap();

    let events = drain(stream).await;
    let delivered = real(&events);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].event_type, EventType::GenerationCancelled);
    assert_eq!(delivered[0].log_seq, Some(LogSeq(4)));
}

#[tokio::test]
async fn test_reconnect_replay_is_deduplicated() {
    let (_store, publisher, gateway) = setup();
    let run_id = Uuid::new_v4();
    publish_scenes(&publisher, run_id, 1..6).await;

    let mut buffer = EventBuffer::new(100);

    // First connection sees everything published so far
    let mut first = gateway.subscribe(run_id, StartFrom::After(LogSeq::ORIGIN)).await.unwrap();
    let mut last_seen = LogSeq::ORIGIN;
    while let Some(event) = first.next().await {
        if let Some(seq) = event.log_seq {
            assert!(buffer.push(event));
            last_seen = seq;
            if seq == LogSeq(5) {
                break;
            }
        }
    }
    drop(first);

    publisher
        .publish(run_id, EventType::GenerationComplete, json!({}))
        .await
        .unwrap();

    // The client reconnects from an older offset than it has seen
    let replay = drain(gateway.subscribe(run_id, StartFrom::After(LogSeq(3))).await.unwrap()).await;
    let accepted: Vec<u64> = real(&replay)
        .into_iter()
        .filter(|e| buffer.push((*e).clone()))
        .map(|e| e.log_seq.unwrap().0)
        .collect();

    assert_eq!(last_seen, LogSeq(5));
    assert_eq!(accepted, vec![6]);
    assert_eq!(buffer.len(), 6);
}

#[tokio::test]
async fn test_runs_are_isolated() {
    let (_store, publisher, gateway) = setup();
    let run_a = Uuid::new_v4();
    let run_b = Uuid::new_v4();

    publish_scenes(&publisher, run_a, 1..3).await;
    publish_scenes(&publisher, run_b, 1..4).await;

    let history_a = gateway.get_history(run_a, 100).await.unwrap();
    let history_b = gateway.get_history(run_b, 100).await.unwrap();
    assert_eq!(history_a.len(), 2);
    assert_eq!(history_b.len(), 3);
    assert!(history_a.iter().all(|e| e.run_id == run_a));

    // Each run log numbers its own entries
    assert_eq!(history_a[0].log_seq, Some(LogSeq(1)));
    assert_eq!(history_b[0].log_seq, Some(LogSeq(1)));

    let recent = gateway.get_history(run_b, 2).await.unwrap();
    let scenes: Vec<u64> = recent
        .iter()
        .map(|e| e.payload["scene"].as_u64().unwrap())
        .collect();
    assert_eq!(scenes, vec![2, 3]);
}

#[tokio::test]
async fn test_global_log_feeds_consumer_groups() {
    let (store, publisher, _gateway) = setup();
    let monitor = LagMonitor::new(Some(store.clone()), MonitorSettings::default());
    monitor
        .register_group("archive", GroupStart::Beginning)
        .await
        .unwrap();

    publish_scenes(&publisher, Uuid::new_v4(), 1..3).await;
    publish_scenes(&publisher, Uuid::new_v4(), 1..4).await;

    assert_eq!(store.len(GLOBAL_LOG).await.unwrap(), 5);
    assert_eq!(monitor.lag("archive").await.unwrap(), 5);

    let read = monitor.read("archive", "archive-1", 10).await.unwrap();
    assert_eq!(read.len(), 5);
    assert_eq!(monitor.lag("archive").await.unwrap(), 0);

    let report = monitor.report().await.unwrap();
    assert!(report.is_healthy());
}
