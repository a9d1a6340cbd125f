//! Worker registry
//!
//! A keyed pool of [`WorkerHandle`]s. The registry spawns a worker on first
//! demand for a [`ModelKey`], makes sure concurrent requesters for the same
//! key share a single spawn, and tears workers down on request.
//!
//! The map lock only guards map mutation and is never held across an await;
//! slow work (launching, connecting, loading) runs in a spawned task while
//! a placeholder marks the key as loading.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub mod config;
pub mod key;
pub mod metrics;

pub use config::RegistryConfig;
pub use key::ModelKey;
pub use metrics::RegistryMetrics;

use crate::config::{BackendConfig, GatewayConfig};
use crate::model_worker::{
    BackendFactory, GrpcLauncher, HandleSettings, LauncherConfig, WorkerHandle, WorkerState,
};
use crate::{Error, Result};

type SpawnResult = Option<Result<Arc<WorkerHandle>>>;

enum Slot {
    /// Spawn in progress; waiters watch for the outcome
    Loading {
        id: u64,
        rx: watch::Receiver<SpawnResult>,
    },
    Ready(Arc<WorkerHandle>),
}

type WorkerMap = Arc<Mutex<HashMap<ModelKey, Slot>>>;

/// Snapshot of one live worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub key: ModelKey,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_used: DateTime<Utc>,
    /// Operations served so far
    pub requests: u64,
}

/// Process pool keyed by [`ModelKey`]
///
/// Constructed once at startup and shared by reference with every
/// collaborator.
pub struct Registry {
    config: RegistryConfig,
    factory: Arc<BackendFactory>,
    workers: WorkerMap,
    metrics: Arc<Mutex<RegistryMetrics>>,
    next_id: AtomicU64,
}

impl Registry {
    /// Create a new registry with configuration
    pub fn new(config: RegistryConfig, factory: BackendFactory) -> Self {
        Self {
            config,
            factory: Arc::new(factory),
            workers: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(Mutex::new(RegistryMetrics::default())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registry launching gRPC worker processes as configured
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        let launcher = GrpcLauncher::shared(LauncherConfig::from_gateway(config));
        Self::new(
            RegistryConfig::from_gateway(config),
            BackendFactory::grpc(launcher),
        )
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn factory(&self) -> &BackendFactory {
        &self.factory
    }

    /// Key a resolved config maps to
    pub fn key_for(&self, config: &BackendConfig) -> ModelKey {
        ModelKey::for_config(config, &self.config.models_path)
    }

    /// Return the live worker for `config`, spawning and loading one if needed
    ///
    /// Concurrent callers for the same key share one spawn and all receive
    /// the same handle or the same error. Failed spawns are never cached.
    pub async fn get_or_create(&self, config: &BackendConfig) -> Result<Arc<WorkerHandle>> {
        let key = self.key_for(config);

        let (spawn_id, mut rx) = {
            let mut workers = self.workers.lock();
            match workers.get(&key) {
                Some(Slot::Ready(handle)) if handle.is_usable() => {
                    self.metrics.lock().increment_hits();
                    debug!(model = %key, "Worker cache hit");
                    return Ok(Arc::clone(handle));
                }
                Some(Slot::Ready(handle)) => {
                    warn!(model = %key, state = %handle.state(), "Evicting dead worker");
                    let stale = Arc::clone(handle);
                    workers.remove(&key);
                    self.metrics.lock().increment_evictions();
                    retire(stale);
                    self.start_spawn(&mut workers, key.clone(), config)
                }
                Some(Slot::Loading { id, rx }) => {
                    self.metrics.lock().increment_coalesced();
                    debug!(model = %key, "Joining in-flight spawn");
                    (*id, rx.clone())
                }
                None => self.start_spawn(&mut workers, key.clone(), config),
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };

        outcome.unwrap_or_else(|| {
            // spawn task died without reporting
            let mut workers = self.workers.lock();
            if matches!(workers.get(&key), Some(Slot::Loading { id, .. }) if *id == spawn_id) {
                workers.remove(&key);
            }
            Err(Error::LoadFailed(
                key.to_string(),
                "spawn task ended without a result".to_string(),
            ))
        })
    }

    /// Existing live worker for `key`, without spawning
    pub fn lookup(&self, key: &ModelKey) -> Option<Arc<WorkerHandle>> {
        match self.workers.lock().get(key) {
            Some(Slot::Ready(handle)) if handle.is_usable() => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Stop the worker for `key`, if any
    ///
    /// Unloads the model, terminates the process and removes the entry. An
    /// operation already running on the handle finishes first, and a spawn
    /// in flight is awaited and torn down. Calling this for a key with no
    /// worker is a no-op.
    pub async fn stop(&self, key: &ModelKey) -> Result<()> {
        let slot = self.workers.lock().remove(key);
        match slot {
            Some(Slot::Ready(handle)) => {
                info!(model = %key, "Stopping worker");
                handle.shutdown().await;
            }
            Some(Slot::Loading { rx, .. }) => {
                info!(model = %key, "Abandoning in-flight spawn");
                settle(rx).await;
            }
            None => debug!(model = %key, "No worker to stop"),
        }
        Ok(())
    }

    /// Stop every worker; used at process shutdown
    pub async fn stop_all(&self) -> Result<()> {
        let drained: Vec<(ModelKey, Slot)> = self.workers.lock().drain().collect();
        info!(count = drained.len(), "Stopping all workers");

        let shutdowns = drained.into_iter().map(|(_, slot)| async move {
            match slot {
                Slot::Ready(handle) => handle.shutdown().await,
                Slot::Loading { rx, .. } => settle(rx).await,
            }
        });
        futures::future::join_all(shutdowns).await;
        Ok(())
    }

    /// Remove `handle` if it is still the registered worker for its key
    ///
    /// Returns `false` when the key was already stopped or respawned, so a
    /// late failure report never tears down a fresh worker.
    pub async fn evict(&self, handle: &Arc<WorkerHandle>) -> bool {
        self.remove_handle(handle, false).await
    }

    /// Like [`evict`](Self::evict), but kills the worker process before
    /// waiting for the operation it is stuck in
    pub async fn evict_stuck(&self, handle: &Arc<WorkerHandle>) -> bool {
        self.remove_handle(handle, true).await
    }

    async fn remove_handle(&self, handle: &Arc<WorkerHandle>, force: bool) -> bool {
        let removed = {
            let mut workers = self.workers.lock();
            let current = matches!(
                workers.get(handle.key()),
                Some(Slot::Ready(h)) if h.id() == handle.id()
            );
            if current {
                workers.remove(handle.key());
            }
            current
        };

        if removed {
            self.metrics.lock().increment_evictions();
            warn!(model = %handle.key(), force, "Evicting worker");
            if force {
                handle.abort().await;
            } else {
                handle.shutdown().await;
            }
        }
        removed
    }

    /// Live handles, for pollers such as the watchdog
    pub fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(handle) => Some(Arc::clone(handle)),
                Slot::Loading { .. } => None,
            })
            .collect()
    }

    /// Snapshot of every loaded worker, sorted by key
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .handles()
            .iter()
            .map(|handle| {
                let idle = chrono::Duration::from_std(handle.idle_for())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                WorkerInfo {
                    key: handle.key().clone(),
                    state: handle.state(),
                    pid: handle.pid(),
                    loaded_at: handle.loaded_at(),
                    last_used: Utc::now() - idle,
                    requests: handle.total_requests(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Get registry metrics
    pub fn metrics(&self) -> RegistryMetrics {
        let mut snapshot = self.metrics.lock().clone();
        snapshot.active_workers = self.len();
        snapshot
    }

    /// Number of entries, including spawns in flight
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a placeholder for `key` and launch the spawn task
    fn start_spawn(
        &self,
        workers: &mut HashMap<ModelKey, Slot>,
        key: ModelKey,
        config: &BackendConfig,
    ) -> (u64, watch::Receiver<SpawnResult>) {
        if let Some(limit) = self.config.max_workers {
            self.make_room(workers, limit);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        workers.insert(
            key.clone(),
            Slot::Loading {
                id,
                rx: rx.clone(),
            },
        );
        self.metrics.lock().increment_misses();

        let task = SpawnTask {
            id,
            key,
            config: config.clone(),
            factory: Arc::clone(&self.factory),
            settings: self.config.handle.clone(),
            models_path: self.config.models_path.clone(),
        };
        let workers = Arc::clone(&self.workers);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let key = task.key.clone();
            let result = task.run().await;
            metrics.lock().record_spawn(result.is_ok());

            let result = match result {
                Ok(handle) => {
                    let installed = {
                        let mut workers = workers.lock();
                        let ours = matches!(
                            workers.get(&key),
                            Some(Slot::Loading { id: current, .. }) if *current == id
                        );
                        if ours {
                            workers.insert(key.clone(), Slot::Ready(Arc::clone(&handle)));
                        }
                        ours
                    };
                    if installed {
                        info!(model = %key, pid = ?handle.pid(), "Worker ready");
                        Ok(handle)
                    } else {
                        // stopped while loading
                        handle.shutdown().await;
                        Err(Error::LoadFailed(
                            key.to_string(),
                            "worker was stopped while loading".to_string(),
                        ))
                    }
                }
                Err(e) => {
                    warn!(model = %key, "Worker spawn failed: {}", e);
                    let mut workers = workers.lock();
                    if matches!(workers.get(&key), Some(Slot::Loading { id: current, .. }) if *current == id)
                    {
                        workers.remove(&key);
                    }
                    Err(e)
                }
            };

            let _ = tx.send(Some(result));
        });

        (id, rx)
    }

    /// Stop the least recently used idle worker while at capacity
    ///
    /// If every worker is busy the spawn proceeds anyway.
    fn make_room(&self, workers: &mut HashMap<ModelKey, Slot>, limit: usize) {
        if workers.len() < limit {
            return;
        }
        let victim = workers
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(handle) if handle.state() == WorkerState::Ready => {
                    Some((key.clone(), handle.last_used()))
                }
                _ => None,
            })
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(key, _)| key);

        match victim.and_then(|key| workers.remove(&key)) {
            Some(Slot::Ready(handle)) => {
                info!(model = %handle.key(), limit, "Evicting least recently used worker");
                self.metrics.lock().increment_evictions();
                retire(handle);
            }
            _ => debug!(limit, "At capacity with no idle worker, spawning anyway"),
        }
    }
}

/// Wait until an abandoned spawn has reported
///
/// The spawn task notices it lost its slot and shuts the fresh worker down
/// before sending, so once this returns no process is left behind.
async fn settle(mut rx: watch::Receiver<SpawnResult>) {
    let _ = rx.wait_for(Option::is_some).await;
}

/// Tear a removed handle down in the background
fn retire(handle: Arc<WorkerHandle>) {
    tokio::spawn(async move { handle.shutdown().await });
}

/// Everything the detached spawn needs
struct SpawnTask {
    id: u64,
    key: ModelKey,
    config: BackendConfig,
    factory: Arc<BackendFactory>,
    settings: HandleSettings,
    models_path: std::path::PathBuf,
}

impl SpawnTask {
    async fn run(self) -> Result<Arc<WorkerHandle>> {
        let (capabilities, launcher) = self.factory.resolve(&self.key.backend)?;

        info!(model = %self.key, "Spawning worker");
        let worker = launcher
            .launch(&self.key, &self.config)
            .await
            .map_err(|e| match e {
                e @ Error::BackendSpawnFailed { .. } => e,
                other => Error::BackendSpawnFailed {
                    backend: self.key.backend.clone(),
                    reason: other.to_string(),
                },
            })?;

        let handle = WorkerHandle::new(self.id, self.key.clone(), worker, capabilities, self.settings);
        if let Err(e) = handle.load(self.config.model_options(&self.models_path)).await {
            handle.shutdown().await;
            return Err(e);
        }
        Ok(Arc::new(handle))
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let live = self.len();
        if live > 0 {
            warn!(live, "Registry dropped with live workers; call stop_all first");
        }
    }
}
