//! Append-only log store.
//!
//! A store holds named logs (one per run plus the global monitoring log).
//! Entries are immutable once appended; the only mutation is approximate
//! trimming of the oldest entries. Five primitives are required of any
//! backend: append-with-trim, range read, tail-follow read with timeout,
//! length, and named consumer groups with pending/lag counts.

use std::collections::{hash_map, BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::domain::LogSeq;

/// Errors raised by a log store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Log store unavailable: {0}")]
    Unavailable(String),

    #[error("Unsupported log store URL: {0}")]
    UnsupportedUrl(String),

    #[error("Consumer group '{group}' does not exist on '{key}'")]
    NoSuchGroup { key: String, group: String },

    #[error("Consumer group '{group}' already exists on '{key}'")]
    GroupExists { key: String, group: String },

    #[error("Log file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One stored entry. `body` is the serialized event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub seq: LogSeq,
    pub body: String,
}

/// Where a new consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Deliver every retained entry
    Beginning,
    /// Deliver only entries appended after the group was created
    Latest,
}

/// Delivery state of one consumer group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    /// Delivered but not yet acknowledged
    pub pending: usize,
    pub last_delivered: LogSeq,
    /// Retained entries after `last_delivered`
    pub lag: usize,
}

/// Shared log store used by the publisher, the gateway and monitoring
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Append one entry, then trim the log to roughly `max_len` entries
    /// (`0` disables trimming). Returns the assigned sequence.
    async fn append(&self, key: &str, body: String, max_len: usize) -> Result<LogSeq, StoreError>;

    /// Up to `count` entries with a sequence greater than `after`, ascending
    async fn range(&self, key: &str, after: LogSeq, count: usize)
        -> Result<Vec<LogEntry>, StoreError>;

    /// The last `count` entries, ascending
    async fn tail(&self, key: &str, count: usize) -> Result<Vec<LogEntry>, StoreError>;

    /// Number of retained entries
    async fn len(&self, key: &str) -> Result<usize, StoreError>;

    /// Highest sequence ever assigned (`LogSeq::ORIGIN` for an empty log)
    async fn last_seq(&self, key: &str) -> Result<LogSeq, StoreError>;

    /// Open a dedicated read handle for blocking tail-follow reads
    async fn open_reader(&self) -> Result<Box<dyn LogReader>, StoreError>;

    async fn create_group(&self, key: &str, group: &str, start: GroupStart)
        -> Result<(), StoreError>;

    /// Deliver up to `count` new entries to `consumer` on behalf of `group`
    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// Acknowledge delivered entries; returns how many were pending
    async fn ack(&self, key: &str, group: &str, seqs: &[LogSeq]) -> Result<usize, StoreError>;

    async fn groups(&self, key: &str) -> Result<Vec<GroupInfo>, StoreError>;

    /// Connectivity check
    async fn ping(&self) -> Result<(), StoreError>;
}

/// A read handle owned by exactly one subscription.
///
/// Blocking on one reader never delays appends or other readers.
#[async_trait]
pub trait LogReader: Send {
    /// Entries after `after`, waiting up to `block` for at least one to appear.
    /// An empty result means the wait timed out.
    async fn read_after(
        &mut self,
        key: &str,
        after: LogSeq,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, StoreError>;
}

/// Trim only once the log overshoots by this much, so trimming stays cheap
fn trim_slack(max_len: usize) -> usize {
    (max_len / 10).max(1)
}

struct GroupState {
    last_delivered: LogSeq,
    consumers: BTreeSet<String>,
    /// Delivered, unacknowledged entries and the consumer holding each
    pending: BTreeMap<LogSeq, String>,
}

struct StreamLog {
    entries: VecDeque<LogEntry>,
    last_seq: LogSeq,
    groups: BTreeMap<String, GroupState>,
    tail_tx: watch::Sender<LogSeq>,
}

impl StreamLog {
    fn new() -> Self {
        let (tail_tx, _) = watch::channel(LogSeq::ORIGIN);
        Self {
            entries: VecDeque::new(),
            last_seq: LogSeq::ORIGIN,
            groups: BTreeMap::new(),
            tail_tx,
        }
    }

    fn after(&self, after: LogSeq, count: usize) -> Vec<LogEntry> {
        // Entries are sorted by seq; skip the prefix at or before `after`
        let start = self.entries.partition_point(|e| e.seq <= after);
        self.entries.iter().skip(start).take(count).cloned().collect()
    }

    fn count_after(&self, after: LogSeq) -> usize {
        self.entries.len() - self.entries.partition_point(|e| e.seq <= after)
    }
}

#[derive(Default)]
struct Inner {
    streams: RwLock<HashMap<String, StreamLog>>,
    offline: AtomicBool,
}

impl Inner {
    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<String, StreamLog>) -> T) -> Result<T, StoreError> {
        self.check_online()?;
        let streams = self
            .streams
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(f(&streams))
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, StreamLog>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_online()?;
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        f(&mut streams)
    }

    fn range(&self, key: &str, after: LogSeq, count: usize) -> Result<Vec<LogEntry>, StoreError> {
        self.read(|streams| {
            streams
                .get(key)
                .map(|log| log.after(after, count))
                .unwrap_or_default()
        })
    }

    fn subscribe(&self, key: &str) -> Result<watch::Receiver<LogSeq>, StoreError> {
        self.write(|streams| {
            let log = streams.entry(key.to_string()).or_insert_with(StreamLog::new);
            Ok(log.tail_tx.subscribe())
        })
    }
}

/// In-process log store (`memory://`).
///
/// Cloning yields another handle to the same logs.
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    inner: Arc<Inner>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `Unavailable` until switched back.
    /// Used to exercise transient-error paths.
    pub fn simulate_outage(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Seed a log that has never been written with entries kept elsewhere.
    /// A log that already holds entries is left alone.
    pub(crate) fn preload(&self, key: &str, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        self.inner.write(|streams| {
            let log = streams.entry(key.to_string()).or_insert_with(StreamLog::new);
            let last = entries.last().map(|e| e.seq);
            if let (LogSeq::ORIGIN, Some(last)) = (log.last_seq, last) {
                log.entries = entries.into();
                log.last_seq = last;
                log.tail_tx.send_replace(last);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, key: &str, body: String, max_len: usize) -> Result<LogSeq, StoreError> {
        self.inner.write(|streams| {
            let log = streams.entry(key.to_string()).or_insert_with(StreamLog::new);
            let seq = log.last_seq.next();
            log.entries.push_back(LogEntry { seq, body });
            log.last_seq = seq;

            if max_len > 0 && log.entries.len() > max_len + trim_slack(max_len) {
                let excess = log.entries.len() - max_len;
                log.entries.drain(..excess);
            }

            log.tail_tx.send_replace(seq);
            Ok(seq)
        })
    }

    async fn range(
        &self,
        key: &str,
        after: LogSeq,
        count: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        self.inner.range(key, after, count)
    }

    async fn tail(&self, key: &str, count: usize) -> Result<Vec<LogEntry>, StoreError> {
        self.inner.read(|streams| {
            streams
                .get(key)
                .map(|log| {
                    let skip = log.entries.len().saturating_sub(count);
                    log.entries.iter().skip(skip).cloned().collect()
                })
                .unwrap_or_default()
        })
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        self.inner
            .read(|streams| streams.get(key).map(|log| log.entries.len()).unwrap_or(0))
    }

    async fn last_seq(&self, key: &str) -> Result<LogSeq, StoreError> {
        self.inner.read(|streams| {
            streams
                .get(key)
                .map(|log| log.last_seq)
                .unwrap_or(LogSeq::ORIGIN)
        })
    }

    async fn open_reader(&self) -> Result<Box<dyn LogReader>, StoreError> {
        self.inner.check_online()?;
        Ok(Box::new(MemoryLogReader {
            inner: Arc::clone(&self.inner),
            watchers: HashMap::new(),
        }))
    }

    async fn create_group(
        &self,
        key: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), StoreError> {
        self.inner.write(|streams| {
            let log = streams.entry(key.to_string()).or_insert_with(StreamLog::new);
            if log.groups.contains_key(group) {
                return Err(StoreError::GroupExists {
                    key: key.to_string(),
                    group: group.to_string(),
                });
            }
            let last_delivered = match start {
                GroupStart::Beginning => LogSeq::ORIGIN,
                GroupStart::Latest => log.last_seq,
            };
            log.groups.insert(
                group.to_string(),
                GroupState {
                    last_delivered,
                    consumers: BTreeSet::new(),
                    pending: BTreeMap::new(),
                },
            );
            Ok(())
        })
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        self.inner.write(|streams| {
            let missing = || StoreError::NoSuchGroup {
                key: key.to_string(),
                group: group.to_string(),
            };
            let log = streams.get_mut(key).ok_or_else(missing)?;
            let cursor = log.groups.get(group).ok_or_else(missing)?.last_delivered;
            let entries = log.after(cursor, count);

            let state = log.groups.get_mut(group).ok_or_else(missing)?;
            state.consumers.insert(consumer.to_string());
            for entry in &entries {
                state.pending.insert(entry.seq, consumer.to_string());
                state.last_delivered = entry.seq;
            }
            Ok(entries)
        })
    }

    async fn ack(&self, key: &str, group: &str, seqs: &[LogSeq]) -> Result<usize, StoreError> {
        self.inner.write(|streams| {
            let state = streams
                .get_mut(key)
                .and_then(|log| log.groups.get_mut(group))
                .ok_or_else(|| StoreError::NoSuchGroup {
                    key: key.to_string(),
                    group: group.to_string(),
                })?;
            Ok(seqs
                .iter()
                .filter(|seq| state.pending.remove(seq).is_some())
                .count())
        })
    }

    async fn groups(&self, key: &str) -> Result<Vec<GroupInfo>, StoreError> {
        self.inner.read(|streams| {
            let Some(log) = streams.get(key) else {
                return Vec::new();
            };
            log.groups
                .iter()
                .map(|(name, state)| GroupInfo {
                    name: name.clone(),
                    consumers: state.consumers.len(),
                    pending: state.pending.len(),
                    last_delivered: state.last_delivered,
                    lag: log.count_after(state.last_delivered),
                })
                .collect()
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.check_online()
    }
}

/// Read handle with its own change watchers, one per followed log
struct MemoryLogReader {
    inner: Arc<Inner>,
    watchers: HashMap<String, watch::Receiver<LogSeq>>,
}

#[async_trait]
impl LogReader for MemoryLogReader {
    async fn read_after(
        &mut self,
        key: &str,
        after: LogSeq,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let deadline = Instant::now() + block;
        let rx = match self.watchers.entry(key.to_string()) {
            hash_map::Entry::Occupied(entry) => entry.into_mut(),
            hash_map::Entry::Vacant(entry) => entry.insert(self.inner.subscribe(key)?),
        };

        loop {
            // Mark the current tail as seen before reading so an append
            // racing with the read still wakes the wait below.
            rx.borrow_and_update();
            let entries = self.inner.range(key, after, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(StoreError::Unavailable(format!("log '{}' was dropped", key)))
                }
                Err(_) => return Ok(Vec::new()),
            }
        }
    }
}
