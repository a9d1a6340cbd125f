//! Resource monitor
//!
//! A passive sampling and control surface over the registry: callers can
//! ask what a model's worker is using and force it down. Eviction policy
//! lives in the separately started [`WatchDog`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

pub mod watchdog;

pub use watchdog::WatchDog;

use crate::config::{ConfigLoader, RequestOverrides};
use crate::model_registry::{ModelKey, Registry};
use crate::model_worker::{WorkerHandle, WorkerState};
use crate::proto;
use crate::{Error, Result};

/// Deadline for a single `Status` probe
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Memory figures for one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    /// Total bytes
    pub total: u64,
    /// Per-component bytes, as reported by the worker
    pub breakdown: BTreeMap<String, u64>,
}

impl From<proto::MemoryUsageData> for MemoryUsage {
    fn from(data: proto::MemoryUsageData) -> Self {
        Self {
            total: data.total,
            breakdown: data.breakdown.into_iter().collect(),
        }
    }
}

/// Usage sample for one live worker
#[derive(Debug, Clone, Serialize)]
pub struct BackendUsage {
    pub key: ModelKey,
    /// State as reported by the worker, or `Busy` if it was mid-operation
    pub state: WorkerState,
    pub memory: Option<MemoryUsage>,
    pub pid: Option<u32>,
    pub uptime: Duration,
    pub idle_for: Duration,
}

/// Samples and force-stops workers by model name
pub struct BackendMonitor {
    loader: Arc<ConfigLoader>,
    registry: Arc<Registry>,
}

impl BackendMonitor {
    pub fn new(loader: Arc<ConfigLoader>, registry: Arc<Registry>) -> Self {
        Self { loader, registry }
    }

    /// Sample the worker backing `model` without spawning one
    ///
    /// Fails with `ConfigNotFound` for unknown models and `NotRunning` when
    /// the model has no live worker.
    pub async fn check_and_sample(&self, model: &str) -> Result<BackendUsage> {
        let key = self.key_for(model)?;
        let handle = self
            .registry
            .lookup(&key)
            .ok_or_else(|| Error::NotRunning(model.to_string()))?;
        sample(&handle).await
    }

    /// Sample every live worker; workers that fail to answer are skipped
    pub async fn sample_all(&self) -> Vec<BackendUsage> {
        let mut samples = Vec::new();
        for handle in self.registry.handles() {
            match sample(&handle).await {
                Ok(usage) => samples.push(usage),
                Err(e) => debug!(model = %handle.key(), "Sampling failed: {}", e),
            }
        }
        samples.sort_by(|a, b| a.key.cmp(&b.key));
        samples
    }

    /// Force the worker backing `model` down
    ///
    /// The next request for `model` spawns a fresh worker.
    pub async fn shutdown_model(&self, model: &str) -> Result<()> {
        let key = self.key_for(model)?;
        if self.registry.lookup(&key).is_none() {
            // clear a pending spawn, if any, before reporting
            self.registry.stop(&key).await?;
            return Err(Error::NotRunning(model.to_string()));
        }
        info!(model, key = %key, "Shutting down model on request");
        self.registry.stop(&key).await
    }

    fn key_for(&self, model: &str) -> Result<ModelKey> {
        let config = self.loader.resolve(model, &RequestOverrides::default())?;
        Ok(self.registry.key_for(&config))
    }
}

/// Query a handle's state and memory
///
/// A busy handle is not queued behind; its memory comes from the OS instead.
pub(crate) async fn sample(handle: &WorkerHandle) -> Result<BackendUsage> {
    let (state, reported) = match handle.try_status(Some(STATUS_TIMEOUT)).await {
        Some(Ok(response)) => {
            let state = WorkerState::from(response.state());
            let memory = response
                .memory
                .filter(|m| m.total > 0)
                .map(MemoryUsage::from);
            (state, memory)
        }
        Some(Err(e)) => return Err(e),
        None => (WorkerState::Busy, None),
    };

    let memory = reported.or_else(|| {
        handle.resident_memory().map(|rss| MemoryUsage {
            total: rss,
            breakdown: BTreeMap::from([("rss".to_string(), rss)]),
        })
    });

    Ok(BackendUsage {
        key: handle.key().clone(),
        state,
        memory,
        pid: handle.pid(),
        uptime: handle.uptime(),
        idle_for: handle.idle_for(),
    })
}
