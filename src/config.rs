//! Configuration for chronicle.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CHRONICLE_HOME, CHRONICLE_LOG_URL)
//! 2. Config file (.chronicle/config.yaml)
//! 3. Defaults (~/.chronicle, gateway disabled)
//!
//! The config file is the nearest `.chronicle/config.yaml` found walking up
//! from the working directory; `paths.home` in it is relative to that
//! `.chronicle/` directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{CommandStep, Step};
use crate::core::limits::GenerationLimits;
use crate::core::phases::RetryPolicy;
use crate::core::steps::StepRegistry;
use crate::domain::StepName;
use crate::stream::{GatewaySettings, MonitorSettings, PublisherSettings};

/// State directory override
pub const HOME_ENV: &str = "CHRONICLE_HOME";
/// Log store URL; without it the gateway is disabled
pub const LOG_URL_ENV: &str = "CHRONICLE_LOG_URL";

/// Loaded once per process; a load error is kept as its message
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// `.chronicle/config.yaml` as written on disk
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub log_store: LogStoreConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// External command per step
    #[serde(default)]
    pub steps: BTreeMap<StepName, StepCommandConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .chronicle/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogStoreConfig {
    /// Connection URL, e.g. `memory://` or `file://<dir>`
    pub url: Option<String>,
    pub run_max_len: Option<usize>,
    pub global_max_len: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamConfig {
    pub heartbeat_seconds: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub error_backoff_ms: Option<u64>,
    pub history_limit: Option<usize>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfig {
    pub lag_threshold: Option<usize>,
    pub interval_seconds: Option<u64>,
    /// Consumer groups registered on the global log at server start
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationConfig {
    #[serde(flatten)]
    pub limits: GenerationLimits,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecoveryConfig {
    /// Days to keep run snapshots; 0 keeps them forever
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
    /// Permissive CORS for local UI development
    pub dev_mode: Option<bool>,
}

/// External command backing one step
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// HTTP server settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: String,
    pub dev_mode: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            dev_mode: false,
        }
    }
}

/// Effective settings after merging file, environment and defaults
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to chronicle home (engine state)
    pub home: PathBuf,
    /// Config file the settings came from, if any
    pub config_file: Option<PathBuf>,
    /// Log store URL; `None` disables the gateway
    pub log_url: Option<String>,
    pub publisher: PublisherSettings,
    pub gateway: GatewaySettings,
    pub monitor: MonitorSettings,
    pub consumer_groups: Vec<String>,
    pub limits: GenerationLimits,
    pub retry: RetryPolicy,
    pub retention_days: u32,
    pub server: ServerSettings,
    pub steps: BTreeMap<StepName, StepCommandConfig>,
}

impl ResolvedConfig {
    /// Directory holding per-run state ($CHRONICLE_HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Dispatch table with a `CommandStep` for every configured step
    pub fn step_registry(&self) -> StepRegistry {
        let mut registry = StepRegistry::new();
        for (name, command) in &self.steps {
            let step: Arc<dyn Step> = Arc::new(CommandStep::from_config(command));
            registry.register(*name, step);
        }
        registry
    }
}

/// Nearest `.chronicle/config.yaml` from the working directory upward
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".chronicle").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Relative paths are taken from the `.chronicle/` directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file values, environment and defaults
fn resolve(
    file: ConfigFile,
    config_path: Option<PathBuf>,
    default_home: PathBuf,
    env: impl Fn(&str) -> Option<String>,
) -> ResolvedConfig {
    let home = match (env(HOME_ENV), &file.paths.home, &config_path) {
        (Some(env_home), _, _) => PathBuf::from(env_home),
        (None, Some(home_path), Some(config_path)) => {
            let chronicle_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(chronicle_dir, home_path)
        }
        _ => default_home,
    };

    let log_url = env(LOG_URL_ENV)
        .or(file.log_store.url)
        .filter(|url| !url.trim().is_empty());

    let publisher = {
        let defaults = PublisherSettings::default();
        PublisherSettings {
            run_max_len: file.log_store.run_max_len.unwrap_or(defaults.run_max_len),
            global_max_len: file
                .log_store
                .global_max_len
                .unwrap_or(defaults.global_max_len),
        }
    };

    let gateway = {
        let defaults = GatewaySettings::default();
        let stream = &file.stream;
        GatewaySettings {
            heartbeat: stream
                .heartbeat_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat),
            poll_interval: stream
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            error_backoff: stream
                .error_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.error_backoff),
            history_limit: stream.history_limit.unwrap_or(defaults.history_limit),
            batch_size: stream.batch_size.unwrap_or(defaults.batch_size),
        }
    };

    let monitor = {
        let defaults = MonitorSettings::default();
        MonitorSettings {
            lag_threshold: file.monitor.lag_threshold.unwrap_or(defaults.lag_threshold),
            interval: file
                .monitor
                .interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
        }
    };

    let server = {
        let defaults = ServerSettings::default();
        ServerSettings {
            bind: file.server.bind.unwrap_or(defaults.bind),
            dev_mode: file.server.dev_mode.unwrap_or(defaults.dev_mode),
        }
    };

    ResolvedConfig {
        home,
        config_file: config_path,
        log_url,
        publisher,
        gateway,
        monitor,
        consumer_groups: file.monitor.groups,
        limits: file.generation.limits,
        retry: file.generation.retry,
        retention_days: file.recovery.retention_days.unwrap_or(14),
        server,
        steps: file.steps,
    }
}

/// Config file, environment and defaults, in that order of discovery
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".chronicle");

    let config_file = find_config_file();
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(file, config_file, default_home, |key| {
        std::env::var(key).ok()
    }))
}

/// Process-wide configuration
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(ConfigFile::default(), None, PathBuf::from("/h/.chronicle"), no_env);

        assert_eq!(config.home, PathBuf::from("/h/.chronicle"));
        assert_eq!(config.runs_dir(), PathBuf::from("/h/.chronicle/runs"));
        assert!(config.log_url.is_none());
        assert_eq!(config.retention_days, 14);
        assert_eq!(config.gateway.heartbeat, Duration::from_secs(15));
        assert_eq!(config.gateway.history_limit, 1000);
        assert_eq!(config.publisher.run_max_len, 1000);
        assert_eq!(config.limits, GenerationLimits::default());
        assert_eq!(config.server.bind, "127.0.0.1:8787");
        assert!(config.step_registry().names().is_empty());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let chronicle_dir = temp.path().join(".chronicle");
        std::fs::create_dir_all(&chronicle_dir).unwrap();

        let config_path = chronicle_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
log_store:
  url: memory://
  run_max_len: 200
stream:
  heartbeat_seconds: 5
  history_limit: 50
monitor:
  lag_threshold: 10
  groups: [archive, audit]
generation:
  max_revisions: 2
  archivist_interval: 3
  retry:
    attempts: 1
recovery:
  retention_days: 0
server:
  bind: 0.0.0.0:9000
  dev_mode: true
steps:
  writer:
    command: ./bin/writer
    args: ["--fast"]
  critic:
    command: ./bin/critic
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        let config = resolve(parsed, Some(config_path), PathBuf::from("/unused"), no_env);

        assert!(config.home.ends_with("state"));
        assert_eq!(config.log_url.as_deref(), Some("memory://"));
        assert_eq!(config.publisher.run_max_len, 200);
        assert_eq!(config.gateway.heartbeat, Duration::from_secs(5));
        assert_eq!(config.gateway.history_limit, 50);
        assert_eq!(config.gateway.poll_interval, Duration::from_secs(2));
        assert_eq!(config.monitor.lag_threshold, 10);
        assert_eq!(config.consumer_groups, vec!["archive".to_string(), "audit".to_string()]);
        assert_eq!(config.limits.max_revisions, 2);
        assert_eq!(config.limits.archivist_interval, 3);
        assert_eq!(config.limits.max_scenes, 200);
        assert_eq!(config.retry.attempts, 1);
        assert_eq!(config.retention_days, 0);
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert!(config.server.dev_mode);
        assert_eq!(config.steps[&StepName::Writer].args, vec!["--fast".to_string()]);
        assert_eq!(
            config.step_registry().names(),
            vec![StepName::Writer, StepName::Critic]
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = ConfigFile {
            log_store: LogStoreConfig {
                url: Some("memory://file".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let env: HashMap<&str, &str> = [(HOME_ENV, "/env/home"), (LOG_URL_ENV, "memory://env")]
            .into_iter()
            .collect();

        let config = resolve(file, None, PathBuf::from("/default"), |key| {
            env.get(key).map(|v| v.to_string())
        });
        assert_eq!(config.home, PathBuf::from("/env/home"));
        assert_eq!(config.log_url.as_deref(), Some("memory://env"));
    }

    #[test]
    fn test_blank_log_url_disables_gateway() {
        let config = resolve(ConfigFile::default(), None, PathBuf::from("/d"), |key| {
            (key == LOG_URL_ENV).then(|| "  ".to_string())
        });
        assert!(config.log_url.is_none());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
