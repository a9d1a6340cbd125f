//! Idle and stuck worker eviction
//!
//! The watchdog never starts on its own. Callers either spawn
//! [`WatchDog::run`] or drive [`WatchDog::tick`] on their own schedule.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use localgate_core::{GatewayConfig, Registry, WatchDog};
//! # tokio_test::block_on(async {
//! let config = GatewayConfig::from_env();
//! let registry = Arc::new(Registry::from_gateway(&config));
//! if let Some(watchdog) = WatchDog::from_settings(Arc::clone(&registry), &config.watchdog) {
//!     tokio::spawn(watchdog.run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }));
//! }
//! # });
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::WatchdogSettings;
use crate::model_registry::{ModelKey, Registry};
use crate::model_worker::WorkerState;

/// Periodically stops workers idle or busy for too long
pub struct WatchDog {
    registry: Arc<Registry>,
    interval: Duration,
    idle_timeout: Option<Duration>,
    busy_timeout: Option<Duration>,
}

impl WatchDog {
    pub fn new(registry: Arc<Registry>, settings: &WatchdogSettings) -> Self {
        Self {
            registry,
            interval: settings.interval(),
            idle_timeout: settings.idle_timeout(),
            busy_timeout: settings.busy_timeout(),
        }
    }

    /// Watchdog for `settings`, or `None` when it is disabled
    pub fn from_settings(registry: Arc<Registry>, settings: &WatchdogSettings) -> Option<Self> {
        settings.enabled.then(|| Self::new(registry, settings))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// One pass over the registry; returns the keys it stopped
    pub async fn tick(&self) -> Vec<ModelKey> {
        let mut idle = Vec::new();
        let mut stuck = Vec::new();

        for handle in self.registry.handles() {
            match handle.state() {
                WorkerState::Ready => {
                    if let Some(limit) = self.idle_timeout {
                        if handle.idle_for() > limit {
                            info!(model = %handle.key(), idle = ?handle.idle_for(), "Worker idle too long");
                            idle.push(handle);
                        }
                    }
                }
                WorkerState::Busy => {
                    if let (Some(limit), Some(busy)) = (self.busy_timeout, handle.busy_for()) {
                        if busy > limit {
                            info!(model = %handle.key(), ?busy, "Worker busy too long");
                            stuck.push(handle);
                        }
                    }
                }
                _ => {}
            }
        }

        let registry = &self.registry;
        let idle_stops = idle.into_iter().map(|handle| async move {
            registry.evict(&handle).await.then(|| handle.key().clone())
        });
        let stuck_stops = stuck.into_iter().map(|handle| async move {
            registry.evict_stuck(&handle).await.then(|| handle.key().clone())
        });

        let (idle_done, stuck_done) = futures::future::join(
            futures::future::join_all(idle_stops),
            futures::future::join_all(stuck_stops),
        )
        .await;

        let stopped: Vec<ModelKey> = idle_done.into_iter().chain(stuck_done).flatten().collect();
        debug!(stopped = stopped.len(), "Watchdog pass complete");
        stopped
    }

    /// Tick every interval until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            interval = ?self.interval,
            idle_timeout = ?self.idle_timeout,
            busy_timeout = ?self.busy_timeout,
            "Watchdog started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Watchdog stopped");
    }
}
