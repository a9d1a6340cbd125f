//! Launches worker executables and connects to them over gRPC

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::backend::{BackendLauncher, SpawnedWorker};
use super::client::GrpcBackend;
use crate::config::{is_valid_backend_tag, BackendConfig, GatewayConfig};
use crate::model_registry::ModelKey;
use crate::process::{SpawnConfig, WorkerProcess};
use crate::{Error, Result};

/// Where worker executables live and how to reach them
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Root of bundled worker executables
    pub backend_assets_path: PathBuf,
    /// Backend tag → executable, checked before the bundled ones
    pub external_backends: BTreeMap<String, PathBuf>,
    /// Host workers bind their private port on
    pub bind_host: String,
    pub attempts: u32,
    pub attempts_sleep: Duration,
    pub grace_period: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            backend_assets_path: PathBuf::from("/tmp/localgate/backend_data"),
            external_backends: BTreeMap::new(),
            bind_host: "127.0.0.1".to_string(),
            attempts: 20,
            attempts_sleep: Duration::from_secs(2),
            grace_period: Duration::from_secs(3),
        }
    }
}

impl LauncherConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            backend_assets_path: config.backend_assets_path.clone(),
            external_backends: config.external_backends.clone(),
            bind_host: config.worker.bind_host.clone(),
            attempts: config.worker.attempts,
            attempts_sleep: config.worker.attempts_sleep(),
            grace_period: config.worker.grace_period(),
        }
    }

    /// Register an external worker executable for `tag`
    pub fn with_external_backend(mut self, tag: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.external_backends.insert(tag.into(), path.into());
        self
    }
}

/// Spawns one worker process per model and connects a [`GrpcBackend`]
pub struct GrpcLauncher {
    config: LauncherConfig,
}

impl GrpcLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    pub fn shared(config: LauncherConfig) -> Arc<dyn BackendLauncher> {
        Arc::new(Self::new(config))
    }

    /// Executable for `tag`: external table first, then bundled assets
    pub fn executable_for(&self, tag: &str) -> Result<PathBuf> {
        if !is_valid_backend_tag(tag) {
            return Err(Error::BackendSpawnFailed {
                backend: tag.to_string(),
                reason: "backend tag is not a plain name".to_string(),
            });
        }
        if let Some(path) = self.config.external_backends.get(tag) {
            return Ok(path.clone());
        }
        let bundled = self
            .config
            .backend_assets_path
            .join("backend-assets")
            .join("grpc")
            .join(tag);
        if bundled.is_file() {
            Ok(bundled)
        } else {
            Err(Error::BackendSpawnFailed {
                backend: tag.to_string(),
                reason: format!("no worker executable at {}", bundled.display()),
            })
        }
    }

    /// Ask the OS for a free port on the bind host
    ///
    /// The listener is released before the worker binds it, so another
    /// process could in principle take the port in between.
    fn allocate_address(&self) -> Result<String> {
        let listener = TcpListener::bind((self.config.bind_host.as_str(), 0))?;
        let port = listener.local_addr()?.port();
        drop(listener);
        Ok(format!("{}:{}", self.config.bind_host, port))
    }
}

#[async_trait]
impl BackendLauncher for GrpcLauncher {
    async fn launch(&self, key: &ModelKey, config: &BackendConfig) -> Result<SpawnedWorker> {
        let tag = key.backend.as_str();
        let program = self.executable_for(tag)?;
        let address = self.allocate_address()?;

        let process = WorkerProcess::spawn(
            SpawnConfig::new(program, key.to_string())
                .arg("--addr")
                .arg(address.clone()),
        )
        .map_err(|e| match e {
            Error::BackendSpawnFailed { reason, .. } => Error::BackendSpawnFailed {
                backend: tag.to_string(),
                reason,
            },
            other => other,
        })?;

        let attempts = config.grpc.attempts.unwrap_or(self.config.attempts);
        let attempts_sleep = config
            .grpc
            .attempts_sleep_time
            .map(Duration::from_secs)
            .unwrap_or(self.config.attempts_sleep);

        match GrpcBackend::connect(tag, &address, attempts, attempts_sleep, Some(&process)).await {
            Ok(backend) => Ok(SpawnedWorker {
                backend: Arc::new(backend),
                process: Some(process),
            }),
            Err(e) => {
                if let Err(kill_error) = process.terminate(self.config.grace_period).await {
                    tracing::error!(
                        worker = %key,
                        pid = process.pid(),
                        "Failed to terminate unreachable worker: {}",
                        kill_error
                    );
                }
                Err(e)
            }
        }
    }
}
