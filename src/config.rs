use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for stored document content and report artifacts.
    pub root: PathBuf,
    /// Documents at or below this size are carried inline in the task's
    /// content reference instead of being written to the object store.
    #[serde(default = "default_inline_max_bytes")]
    pub inline_max_bytes: usize,
}

fn default_inline_max_bytes() -> usize {
    16 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    /// `"model"` calls the configured language-model endpoint with heuristic
    /// fallback on unparseable output; `"heuristic"` skips the model entirely.
    #[serde(default = "default_analyzer_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Content beyond this many characters is truncated before prompting,
    /// never rejected.
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
    #[serde(default = "default_analyzer_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            provider: default_analyzer_provider(),
            endpoint: None,
            model: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_content_chars: default_max_content_chars(),
            timeout_secs: default_analyzer_timeout_secs(),
        }
    }
}

impl AnalyzerConfig {
    pub fn model_enabled(&self) -> bool {
        self.provider == "model" && self.endpoint.is_some()
    }
}

fn default_analyzer_provider() -> String {
    "heuristic".to_string()
}
fn default_max_tokens() -> i64 {
    1024
}
fn default_temperature() -> f64 {
    0.1
}
fn default_max_content_chars() -> usize {
    24_000
}
fn default_analyzer_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent worker tasks in `veritor work`.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long a claimed dispatch stays invisible to other workers.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
    /// Idle sleep between queue polls when nothing is claimable.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Hard per-attempt budget; exceeding it is classified as a timeout.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_lease_secs() -> i64 {
    120
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_task_timeout_secs() -> u64 {
    90
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Seconds between health evaluation cycles.
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    /// Lookback window for threshold evaluation, in minutes.
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    /// Hours of per-hour history consulted by the predictive pass.
    #[serde(default = "default_history_hours")]
    pub history_hours: i64,
    /// Worker-fleet resource ids to evaluate each cycle.
    #[serde(default = "default_worker_resources")]
    pub worker_resources: Vec<String>,
    /// Cache-layer resource ids to evaluate each cycle.
    #[serde(default = "default_cache_resources")]
    pub cache_resources: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
            window_minutes: default_window_minutes(),
            history_hours: default_history_hours(),
            worker_resources: default_worker_resources(),
            cache_resources: default_cache_resources(),
        }
    }
}

fn default_monitor_interval_secs() -> u64 {
    300
}
fn default_window_minutes() -> i64 {
    15
}
fn default_history_hours() -> i64 {
    24
}
fn default_worker_resources() -> Vec<String> {
    vec!["worker-fleet".to_string()]
}
fn default_cache_resources() -> Vec<String> {
    vec!["cache".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.worker.concurrency == 0 {
        anyhow::bail!("worker.concurrency must be > 0");
    }
    if config.worker.lease_secs < 1 {
        anyhow::bail!("worker.lease_secs must be >= 1");
    }
    if config.monitor.window_minutes < 1 {
        anyhow::bail!("monitor.window_minutes must be >= 1");
    }

    match config.analyzer.provider.as_str() {
        "model" | "heuristic" => {}
        other => anyhow::bail!(
            "Unknown analyzer provider: '{}'. Must be model or heuristic.",
            other
        ),
    }

    if config.analyzer.provider == "model" && config.analyzer.endpoint.is_none() {
        anyhow::bail!("analyzer.endpoint must be set when provider is 'model'");
    }

    Ok(config)
}
