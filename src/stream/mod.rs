//! Event delivery: the per-run log, its publisher, the live gateway,
//! consumer-group monitoring and the client-side dedup buffer.

pub mod buffer;
pub mod file_store;
pub mod gateway;
pub mod monitor;
pub mod publisher;
pub mod store;

use std::sync::Arc;

pub use buffer::EventBuffer;
pub use file_store::FileLogStore;
pub use gateway::{EventGateway, EventStream, GatewayError, GatewayHealth, GatewaySettings, HealthStatus, StartFrom};
pub use monitor::{LagMonitor, LagReport, MonitorSettings};
pub use publisher::{decode_entry, run_log_key, EventPublisher, PublishError, PublisherSettings, GLOBAL_LOG};
pub use store::{GroupInfo, GroupStart, LogEntry, LogReader, LogStore, MemoryLogStore, StoreError};

/// Open the log store named by a connection URL.
///
/// `memory://` keeps logs in process. `file://<dir>` keeps one JSONL file
/// per log under `<dir>`.
pub fn connect(url: &str) -> Result<Arc<dyn LogStore>, StoreError> {
    match url.split_once("://") {
        Some(("memory", _)) => Ok(Arc::new(MemoryLogStore::new())),
        Some(("file", dir)) if !dir.is_empty() => Ok(Arc::new(FileLogStore::open(dir)?)),
        _ => Err(StoreError::UnsupportedUrl(url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_selects_backend_by_scheme() {
        let store = connect("memory://local").unwrap();
        assert_eq!(store.name(), "memory");

        assert!(matches!(
            connect("redis://localhost:6379"),
            Err(StoreError::UnsupportedUrl(_))
        ));
        assert!(connect("not a url").is_err());
        assert!(matches!(connect("file://"), Err(StoreError::UnsupportedUrl(_))));
    }

    #[test]
    fn test_connect_opens_file_store() {
        let temp = tempfile::TempDir::new().unwrap();
        let url = format!("file://{}", temp.path().join("logs").display());

        let store = connect(&url).unwrap();
        assert_eq!(store.name(), "file");
        assert!(temp.path().join("logs").is_dir());
    }
}
