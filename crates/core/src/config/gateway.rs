//! Gateway-wide settings
//!
//! Configuration can be loaded from a TOML file and/or `LOCALGATE_*`
//! environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backend::ConfigDefaults;
use crate::{Error, Result};

/// Main configuration for the gateway core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Directory holding model files and their YAML records
    #[serde(default = "default_models_path")]
    pub models_path: PathBuf,

    /// Directory holding bundled worker executables
    #[serde(default = "default_backend_assets_path")]
    pub backend_assets_path: PathBuf,

    /// Staging directory for synthesized audio
    #[serde(default = "default_audio_dir")]
    pub audio_dir: PathBuf,

    /// Staging directory for generated images
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,

    /// Default thread count for records that leave it unset
    #[serde(default = "default_threads")]
    pub threads: i32,

    /// Default context size for records that leave it unset
    #[serde(default = "default_context_size")]
    pub context_size: i32,

    /// Default half-precision flag for records that leave it unset
    #[serde(default)]
    pub f16: bool,

    /// Backend tag → worker executable
    #[serde(default)]
    pub external_backends: BTreeMap<String, PathBuf>,

    /// Worker spawn and call settings
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Idle/busy eviction loop settings
    #[serde(default)]
    pub watchdog: WatchdogSettings,
}

/// Worker spawn and call settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Connection attempts while a fresh worker comes up
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Sleep between connection attempts
    #[serde(default = "default_attempts_sleep_ms")]
    pub attempts_sleep_ms: u64,

    /// Default deadline for a single operation; 0 disables it
    #[serde(default)]
    pub call_timeout_secs: u64,

    /// Deadline for the `LoadModel` call
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL on teardown
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// How long a forced stop waits for the killed operation to unwind
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Chunks buffered between a streaming worker and its consumer
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Host workers bind their private port on
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Upper bound on live workers; idle ones are evicted to make room
    #[serde(default)]
    pub max_workers: Option<usize>,
}

/// Idle/busy eviction loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSettings {
    /// The loop only runs when explicitly started and enabled
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_watchdog_interval")]
    pub interval_secs: u64,

    /// Stop workers idle for longer than this; 0 disables the check
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Stop workers busy for longer than this; 0 disables the check
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
}

fn default_models_path() -> PathBuf {
    PathBuf::from("./models")
}

fn default_backend_assets_path() -> PathBuf {
    PathBuf::from("/tmp/localgate/backend_data")
}

fn default_audio_dir() -> PathBuf {
    PathBuf::from("/tmp/localgate/generated/audio")
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("/tmp/localgate/generated/images")
}

fn default_threads() -> i32 {
    num_cpus::get_physical() as i32
}

fn default_context_size() -> i32 {
    512
}

fn default_attempts() -> u32 {
    20
}

fn default_attempts_sleep_ms() -> u64 {
    2000
}

fn default_load_timeout_secs() -> u64 {
    600
}

fn default_grace_period_ms() -> u64 {
    3000
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_stream_buffer() -> usize {
    32
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_watchdog_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    900 // 15 minutes
}

fn default_busy_timeout() -> u64 {
    300 // 5 minutes
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            attempts_sleep_ms: default_attempts_sleep_ms(),
            call_timeout_secs: 0,
            load_timeout_secs: default_load_timeout_secs(),
            grace_period_ms: default_grace_period_ms(),
            drain_timeout_secs: default_drain_timeout_secs(),
            stream_buffer: default_stream_buffer(),
            bind_host: default_bind_host(),
            max_workers: None,
        }
    }
}

impl WorkerSettings {
    pub fn attempts_sleep(&self) -> Duration {
        Duration::from_millis(self.attempts_sleep_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_watchdog_interval(),
            idle_timeout_secs: default_idle_timeout(),
            busy_timeout_secs: default_busy_timeout(),
        }
    }
}

impl WatchdogSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn busy_timeout(&self) -> Option<Duration> {
        (self.busy_timeout_secs > 0).then(|| Duration::from_secs(self.busy_timeout_secs))
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            models_path: default_models_path(),
            backend_assets_path: default_backend_assets_path(),
            audio_dir: default_audio_dir(),
            image_dir: default_image_dir(),
            threads: default_threads(),
            context_size: default_context_size(),
            f16: false,
            external_backends: BTreeMap::new(),
            worker: WorkerSettings::default(),
            watchdog: WatchdogSettings::default(),
        }
    }
}

/// Parse a `name:path,name:path` list
fn parse_external_backends(raw: &str) -> BTreeMap<String, PathBuf> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, path) = entry.trim().split_once(':')?;
            if name.is_empty() || path.is_empty() {
                return None;
            }
            Some((name.to_string(), PathBuf::from(path)))
        })
        .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = GatewayConfig::default();

        // Storage
        if let Ok(dir) = std::env::var("LOCALGATE_MODELS_PATH") {
            config.models_path = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("LOCALGATE_BACKEND_ASSETS_PATH") {
            config.backend_assets_path = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("LOCALGATE_AUDIO_DIR") {
            config.audio_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("LOCALGATE_IMAGE_DIR") {
            config.image_dir = PathBuf::from(dir);
        }

        // Record defaults
        if let Some(t) = env_parse("LOCALGATE_THREADS") {
            config.threads = t;
        }
        if let Some(c) = env_parse("LOCALGATE_CONTEXT_SIZE") {
            config.context_size = c;
        }
        if let Some(f) = env_parse("LOCALGATE_F16") {
            config.f16 = f;
        }
        if let Ok(raw) = std::env::var("LOCALGATE_EXTERNAL_BACKENDS") {
            config.external_backends = parse_external_backends(&raw);
        }

        // Worker
        if let Some(a) = env_parse("LOCALGATE_WORKER_ATTEMPTS") {
            config.worker.attempts = a;
        }
        if let Some(s) = env_parse("LOCALGATE_WORKER_ATTEMPTS_SLEEP_MS") {
            config.worker.attempts_sleep_ms = s;
        }
        if let Some(t) = env_parse("LOCALGATE_CALL_TIMEOUT_SECS") {
            config.worker.call_timeout_secs = t;
        }
        if let Some(d) = env_parse("LOCALGATE_DRAIN_TIMEOUT_SECS") {
            config.worker.drain_timeout_secs = d;
        }
        if let Some(m) = env_parse("LOCALGATE_MAX_WORKERS") {
            config.worker.max_workers = Some(m);
        }

        // Watchdog
        if let Some(e) = env_parse("LOCALGATE_WATCHDOG") {
            config.watchdog.enabled = e;
        }
        if let Some(t) = env_parse("LOCALGATE_WATCHDOG_IDLE_TIMEOUT_SECS") {
            config.watchdog.idle_timeout_secs = t;
        }
        if let Some(t) = env_parse("LOCALGATE_WATCHDOG_BUSY_TIMEOUT_SECS") {
            config.watchdog.busy_timeout_secs = t;
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }

    /// Defaults applied to per-model records
    pub fn record_defaults(&self) -> ConfigDefaults {
        ConfigDefaults {
            threads: self.threads,
            context_size: self.context_size,
            f16: self.f16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.worker.attempts, 20);
        assert_eq!(config.worker.attempts_sleep(), Duration::from_secs(2));
        assert_eq!(config.worker.call_timeout(), None);
        assert!(!config.watchdog.enabled);
        assert_eq!(config.watchdog.idle_timeout(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
models_path = "/srv/models"
threads = 4

[external_backends]
piper = "/opt/workers/piper"

[worker]
attempts = 5
attempts_sleep_ms = 100
call_timeout_secs = 30
drain_timeout_secs = 5
max_workers = 2

[watchdog]
enabled = true
idle_timeout_secs = 0
"#;

        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.models_path, PathBuf::from("/srv/models"));
        assert_eq!(config.threads, 4);
        assert_eq!(
            config.external_backends.get("piper"),
            Some(&PathBuf::from("/opt/workers/piper"))
        );
        assert_eq!(config.worker.attempts, 5);
        assert_eq!(config.worker.call_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.worker.max_workers, Some(2));
        assert_eq!(config.worker.drain_timeout(), Duration::from_secs(5));
        assert_eq!(config.worker.stream_buffer, 32);
        assert!(config.watchdog.enabled);
        assert_eq!(config.watchdog.idle_timeout(), None);
        assert_eq!(config.watchdog.busy_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_parse_external_backends() {
        let parsed = parse_external_backends("whisper:/opt/w, bark:/opt/bark.py,broken,:x");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("bark"), Some(&PathBuf::from("/opt/bark.py")));
    }

    #[test]
    fn test_load_missing_file_falls_back() {
        let config = GatewayConfig::load(Some("/nonexistent/localgate.toml")).unwrap();
        assert_eq!(config.worker.stream_buffer, 32);
    }
}
