//! File-backed log store (`file://<dir>`).
//!
//! Every log is one JSONL file of `{"seq", "body"}` lines, so sequences
//! and history survive a restart. Reads go through an in-process copy that
//! is loaded from disk the first time a log is touched. Consumer groups are
//! kept in memory only.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::store::{GroupInfo, GroupStart, LogEntry, LogReader, LogStore, MemoryLogStore, StoreError};
use crate::domain::LogSeq;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Deserialize)]
struct StoredEntry {
    seq: LogSeq,
    body: String,
}

#[derive(Clone)]
pub struct FileLogStore {
    inner: Arc<FileInner>,
}

struct FileInner {
    dir: PathBuf,
    cache: MemoryLogStore,
    /// Logs already read from disk. Held across appends so file and cache
    /// agree on the next sequence.
    loaded: Mutex<HashSet<String>>,
}

impl FileLogStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        debug!(dir = %dir.display(), "Opened file log store");
        Ok(Self {
            inner: Arc::new(FileInner {
                dir,
                cache: MemoryLogStore::new(),
                loaded: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn log_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.inner.dir.join(format!("{}.jsonl", name))
    }

    async fn ensure_loaded(&self, key: &str) -> Result<(), StoreError> {
        let mut loaded = self.inner.loaded.lock().await;
        self.load(key, &mut loaded).await
    }

    async fn load(&self, key: &str, loaded: &mut HashSet<String>) -> Result<(), StoreError> {
        if loaded.contains(key) {
            return Ok(());
        }

        let path = self.log_path(key);
        let mut entries = Vec::new();
        let mut torn = false;
        if fs::try_exists(&path).await.map_err(io_error(&path))? {
            let file = fs::File::open(&path).await.map_err(io_error(&path))?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await.map_err(io_error(&path))? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoredEntry>(&line) {
                    Ok(stored) => entries.push(LogEntry {
                        seq: stored.seq,
                        body: stored.body,
                    }),
                    // A crash mid-write leaves a torn last line
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable log line");
                        torn = true;
                    }
                }
            }
            entries.sort_by_key(|e| e.seq);
            entries.dedup_by_key(|e| e.seq);
        }

        debug!(key, entries = entries.len(), "Loaded log from disk");
        self.inner.cache.preload(key, entries)?;
        if torn {
            // Later appends must not land on the end of a partial line
            self.rewrite(key).await?;
        }
        loaded.insert(key.to_string());
        Ok(())
    }

    async fn append_line(&self, key: &str, seq: LogSeq, body: &str) -> Result<(), StoreError> {
        let path = self.log_path(key);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_error(&path))?;

        let line = json!({ "seq": seq, "body": body }).to_string();
        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(io_error(&path))?;
        file.flush().await.map_err(io_error(&path))?;
        Ok(())
    }

    /// Replace the file with what the cache currently holds
    async fn rewrite(&self, key: &str) -> Result<(), StoreError> {
        let path = self.log_path(key);
        let tmp = path.with_extension("jsonl.tmp");
        let entries = self.inner.cache.range(key, LogSeq::ORIGIN, usize::MAX).await?;

        let mut contents = String::new();
        for entry in &entries {
            contents.push_str(&json!({ "seq": entry.seq, "body": entry.body }).to_string());
            contents.push('\n');
        }
        fs::write(&tmp, contents).await.map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).await.map_err(io_error(&path))?;

        debug!(key, retained = entries.len(), "Rewrote log file");
        Ok(())
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn append(&self, key: &str, body: String, max_len: usize) -> Result<LogSeq, StoreError> {
        let mut loaded = self.inner.loaded.lock().await;
        self.load(key, &mut loaded).await?;

        let cache = &self.inner.cache;
        let seq = cache.last_seq(key).await?.next();
        self.append_line(key, seq, &body).await?;

        let before = cache.len(key).await?;
        let assigned = cache.append(key, body, max_len).await?;
        debug_assert_eq!(assigned, seq);
        if cache.len(key).await? <= before {
            self.rewrite(key).await?;
        }
        Ok(assigned)
    }

    async fn range(
        &self,
        key: &str,
        after: LogSeq,
        count: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        self.ensure_loaded(key).await?;
        self.inner.cache.range(key, after, count).await
    }

    async fn tail(&self, key: &str, count: usize) -> Result<Vec<LogEntry>, StoreError> {
        self.ensure_loaded(key).await?;
        self.inner.cache.tail(key, count).await
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        self.ensure_loaded(key).await?;
        self.inner.cache.len(key).await
    }

    async fn last_seq(&self, key: &str) -> Result<LogSeq, StoreError> {
        self.ensure_loaded(key).await?;
        self.inner.cache.last_seq(key).await
    }

    async fn open_reader(&self) -> Result<Box<dyn LogReader>, StoreError> {
        Ok(Box::new(FileLogReader {
            store: self.clone(),
            reader: self.inner.cache.open_reader().await?,
        }))
    }

    async fn create_group(
        &self,
        key: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), StoreError> {
        self.ensure_loaded(key).await?;
        self.inner.cache.create_group(key, group, start).await
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        self.ensure_loaded(key).await?;
        self.inner.cache.read_group(key, group, consumer, count).await
    }

    async fn ack(&self, key: &str, group: &str, seqs: &[LogSeq]) -> Result<usize, StoreError> {
        self.inner.cache.ack(key, group, seqs).await
    }

    async fn groups(&self, key: &str) -> Result<Vec<GroupInfo>, StoreError> {
        self.ensure_loaded(key).await?;
        self.inner.cache.groups(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let dir = &self.inner.dir;
        let meta = fs::metadata(dir).await.map_err(io_error(dir))?;
        if !meta.is_dir() {
            return Err(StoreError::Unavailable(format!("{} is not a directory", dir.display())));
        }
        Ok(())
    }
}

struct FileLogReader {
    store: FileLogStore,
    reader: Box<dyn LogReader>,
}

#[async_trait]
impl LogReader for FileLogReader {
    async fn read_after(
        &mut self,
        key: &str,
        after: LogSeq,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, StoreError> {
        self.store.ensure_loaded(key).await?;
        self.reader.read_after(key, after, count, block).await
    }
}
