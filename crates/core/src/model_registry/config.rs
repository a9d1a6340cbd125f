//! Configuration for the worker registry

use std::path::PathBuf;
use std::time::Duration;

use crate::config::GatewayConfig;
use crate::model_worker::HandleSettings;

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory model files are resolved against
    pub models_path: PathBuf,

    /// Maximum number of live workers; `None` means unbounded
    pub max_workers: Option<usize>,

    /// Settings applied to every handle
    pub handle: HandleSettings,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            models_path: PathBuf::from("./models"),
            max_workers: None,
            handle: HandleSettings::default(),
        }
    }
}

impl RegistryConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_gateway(config: &GatewayConfig) -> Self {
        let worker = &config.worker;
        Self {
            models_path: config.models_path.clone(),
            max_workers: worker.max_workers,
            handle: HandleSettings {
                call_timeout: worker.call_timeout(),
                load_timeout: worker.load_timeout(),
                stream_buffer: worker.stream_buffer,
                grace_period: worker.grace_period(),
                drain_timeout: worker.drain_timeout(),
            },
        }
    }

    pub fn with_models_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.models_path = path.into();
        self
    }

    /// Set maximum number of live workers
    pub fn with_max_workers(mut self, count: usize) -> Self {
        self.max_workers = Some(count);
        self
    }

    /// Set the default per-operation deadline
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.handle.call_timeout = Some(timeout);
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.handle.load_timeout = timeout;
        self
    }

    pub fn with_stream_buffer(mut self, chunks: usize) -> Self {
        self.handle.stream_buffer = chunks;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.handle.grace_period = grace;
        self
    }

    /// Set how long a forced stop waits for the killed operation
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.handle.drain_timeout = timeout;
        self
    }
}
