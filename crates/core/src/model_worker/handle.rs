//! Managed worker handle
//!
//! A [`WorkerHandle`] wraps one loaded model inside one worker and owns the
//! exclusive-access lock for it. Every operation takes the lock for its full
//! duration, so calls against the same handle never overlap inside the
//! worker, while different handles run in parallel.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::backend::{Backend, Capabilities, SpawnedWorker};
use super::status::{StatusTracker, WorkerState};
use super::stream::TokenStream;
use crate::model_registry::ModelKey;
use crate::process::WorkerProcess;
use crate::proto;
use crate::{Error, Result};

/// Timing knobs shared by every handle a registry creates
#[derive(Debug, Clone)]
pub struct HandleSettings {
    /// Deadline for operations whose caller gave none
    pub call_timeout: Option<Duration>,
    pub load_timeout: Duration,
    /// Chunks buffered between a streaming worker and its consumer
    pub stream_buffer: usize,
    /// Time between SIGTERM and SIGKILL on teardown
    pub grace_period: Duration,
    /// How long a forced stop waits for the killed operation to unwind
    pub drain_timeout: Duration,
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self {
            call_timeout: None,
            load_timeout: Duration::from_secs(600),
            stream_buffer: 32,
            grace_period: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Proof that the caller holds a handle's exclusive lock
///
/// Dropping the guard returns the handle to `Ready` unless it went terminal
/// while the operation ran, then releases the lock.
pub(crate) struct BusyGuard {
    status: Arc<Mutex<StatusTracker>>,
    key: ModelKey,
    record: bool,
    _lock: OwnedMutexGuard<()>,
}

impl BusyGuard {
    /// Mark the handle broken; it stays terminal after the guard drops
    pub(crate) fn fail(&self) {
        self.status.lock().set_error();
    }

    pub(crate) fn key(&self) -> &ModelKey {
        &self.key
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.status.lock().finish_op(self.record);
    }
}

/// One loaded model inside one worker
pub struct WorkerHandle {
    id: u64,
    key: ModelKey,
    backend: Arc<dyn Backend>,
    capabilities: Capabilities,
    process: Option<WorkerProcess>,
    lock: Arc<tokio::sync::Mutex<()>>,
    status: Arc<Mutex<StatusTracker>>,
    settings: HandleSettings,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

impl WorkerHandle {
    pub(crate) fn new(
        id: u64,
        key: ModelKey,
        worker: SpawnedWorker,
        capabilities: Capabilities,
        settings: HandleSettings,
    ) -> Self {
        Self {
            id,
            key,
            backend: worker.backend,
            capabilities,
            process: worker.process,
            lock: Arc::new(tokio::sync::Mutex::new(())),
            status: Arc::new(Mutex::new(StatusTracker::new())),
            settings,
        }
    }

    /// Registry-unique identity of this handle
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn state(&self) -> WorkerState {
        self.status.lock().state()
    }

    /// Whether the registry may hand this handle out
    pub fn is_usable(&self) -> bool {
        !self.state().is_terminal()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(WorkerProcess::pid)
    }

    pub fn uptime(&self) -> Duration {
        self.status.lock().uptime()
    }

    pub fn idle_for(&self) -> Duration {
        self.status.lock().idle_for()
    }

    pub fn busy_for(&self) -> Option<Duration> {
        self.status.lock().busy_for()
    }

    pub fn last_used(&self) -> Instant {
        self.status.lock().last_used()
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.status.lock().loaded_at()
    }

    pub fn total_requests(&self) -> u64 {
        self.status.lock().total_requests()
    }

    /// Resident memory of the worker process, read from the OS
    pub fn resident_memory(&self) -> Option<u64> {
        self.process.as_ref().and_then(WorkerProcess::resident_memory)
    }

    /// Issue the initial `Load`; the handle is only published on success
    pub(crate) async fn load(&self, options: proto::ModelOptions) -> Result<()> {
        self.status.lock().set_loading();
        let limit = self.settings.load_timeout;
        let result = match tokio::time::timeout(limit, self.backend.load(options)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Error::LoadFailed(model, reason))) => Err(Error::LoadFailed(model, reason)),
            Ok(Err(e)) => Err(Error::LoadFailed(self.key.to_string(), e.to_string())),
            Err(_) => Err(Error::LoadFailed(
                self.key.to_string(),
                format!("load timed out after {:?}", limit),
            )),
        };

        let mut status = self.status.lock();
        match &result {
            Ok(()) => status.set_ready(),
            Err(_) => status.set_error(),
        }
        result
    }

    pub async fn predict(
        &self,
        options: proto::PredictOptions,
        deadline: Option<Duration>,
    ) -> Result<String> {
        let deadline = self.deadline(deadline);
        self.run(
            "predict",
            Capabilities::PREDICT,
            deadline,
            self.backend.predict(options, deadline),
        )
        .await
    }

    /// Stream a completion, holding the lock until the stream ends or is dropped
    pub async fn predict_stream(
        &self,
        options: proto::PredictOptions,
        deadline: Option<Duration>,
    ) -> Result<TokenStream> {
        let guard = self.acquire("predict_stream", Capabilities::STREAM).await?;
        let started = Instant::now();
        let deadline = self.deadline(deadline);

        let upstream = self
            .with_deadline(deadline, self.backend.predict_stream(options, deadline))
            .await;
        let upstream = match upstream {
            Ok(upstream) => upstream,
            Err(e) => {
                if matches!(e, Error::ConnectionLost(_)) {
                    guard.fail();
                }
                return Err(e);
            }
        };

        let remaining = deadline.map(|d| d.saturating_sub(started.elapsed()));
        Ok(TokenStream::spawn(
            upstream,
            guard,
            self.settings.stream_buffer,
            remaining,
        ))
    }

    pub async fn embed(
        &self,
        options: proto::PredictOptions,
        deadline: Option<Duration>,
    ) -> Result<Vec<f32>> {
        let deadline = self.deadline(deadline);
        self.run(
            "embed",
            Capabilities::EMBED,
            deadline,
            self.backend.embed(options, deadline),
        )
        .await
    }

    pub async fn transcribe(
        &self,
        request: proto::TranscriptRequest,
        deadline: Option<Duration>,
    ) -> Result<proto::TranscriptResult> {
        let deadline = self.deadline(deadline);
        self.run(
            "transcribe",
            Capabilities::TRANSCRIBE,
            deadline,
            self.backend.transcribe(request, deadline),
        )
        .await
    }

    pub async fn synthesize(
        &self,
        request: proto::TtsRequest,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let deadline = self.deadline(deadline);
        self.run(
            "synthesize",
            Capabilities::TTS,
            deadline,
            self.backend.synthesize(request, deadline),
        )
        .await
    }

    pub async fn generate_image(
        &self,
        request: proto::GenerateImageRequest,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let deadline = self.deadline(deadline);
        self.run(
            "generate_image",
            Capabilities::IMAGE,
            deadline,
            self.backend.generate_image(request, deadline),
        )
        .await
    }

    /// Query the worker's state and memory, waiting for the lock
    pub async fn status(&self, deadline: Option<Duration>) -> Result<proto::StatusResponse> {
        let deadline = self.deadline(deadline);
        self.run(
            "status",
            Capabilities::empty(),
            deadline,
            self.backend.status(deadline),
        )
        .await
    }

    /// Query the worker only if no operation is running
    ///
    /// Returns `None` when the handle is busy, so a sampler never queues
    /// behind a long generation.
    pub async fn try_status(&self, deadline: Option<Duration>) -> Option<Result<proto::StatusResponse>> {
        let lock = Arc::clone(&self.lock).try_lock_owned().ok()?;
        let guard = match self.enter(lock, false) {
            Ok(guard) => guard,
            Err(e) => return Some(Err(e)),
        };
        let deadline = self.deadline(deadline);
        let result = self
            .with_deadline(deadline, self.backend.status(deadline))
            .await;
        Some(self.observe(&guard, result))
    }

    /// Unload the model and mark the handle `Unloaded`
    pub async fn unload(&self) -> Result<()> {
        let guard = self.acquire("unload", Capabilities::empty()).await?;
        let result = self
            .with_deadline(None, self.backend.unload())
            .await;
        let result = self.observe(&guard, result);
        self.status.lock().set_unloaded();
        result
    }

    /// Tear the worker down: drain, unload, terminate the process
    ///
    /// Waits for the in-flight operation, however long it runs, to release
    /// the lock; operations queued behind it fail with `ConnectionLost`.
    pub(crate) async fn shutdown(&self) {
        let held = Arc::clone(&self.lock).lock_owned().await;
        self.teardown(Some(held)).await;
    }

    /// Kill the worker without waiting for the running operation
    ///
    /// The in-flight call fails with `ConnectionLost` once the process is
    /// gone and releases the lock. Backends without a process cannot be
    /// killed, so the lock is awaited for at most the drain timeout.
    pub(crate) async fn abort(&self) {
        self.status.lock().set_error();
        if let Some(process) = &self.process {
            if let Err(e) = process.terminate(self.settings.grace_period).await {
                tracing::error!(worker = %self.key, "Failed to kill worker: {}", e);
            }
        }

        let drain = self.settings.drain_timeout;
        let held = match tokio::time::timeout(drain, Arc::clone(&self.lock).lock_owned()).await {
            Ok(lock) => Some(lock),
            Err(_) => {
                warn!(worker = %self.key, "Stuck operation did not unwind within {:?}", drain);
                None
            }
        };
        self.teardown(held).await;
    }

    async fn teardown(&self, held: Option<OwnedMutexGuard<()>>) {
        let was = self.state();
        if !was.is_terminal() && self.process_alive() {
            let limit = self.settings.call_timeout.unwrap_or(self.settings.grace_period);
            match tokio::time::timeout(limit, self.backend.unload()).await {
                Ok(Ok(())) => debug!(worker = %self.key, "Model unloaded"),
                Ok(Err(e)) => warn!(worker = %self.key, "Unload failed: {}", e),
                Err(_) => warn!(worker = %self.key, "Unload timed out after {:?}", limit),
            }
        }
        if was != WorkerState::Error {
            self.status.lock().set_unloaded();
        }

        if let Some(process) = &self.process {
            if let Err(e) = process.terminate(self.settings.grace_period).await {
                tracing::error!(worker = %self.key, "Failed to terminate worker: {}", e);
            }
        }

        drop(held);
        info!(worker = %self.key, "Worker stopped");
    }

    async fn run<T>(
        &self,
        op: &'static str,
        capability: Capabilities,
        deadline: Option<Duration>,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let guard = self.acquire(op, capability).await?;
        let result = self.with_deadline(deadline, call).await;
        self.observe(&guard, result)
    }

    /// Check the capability, then take the lock and enter `Busy`
    async fn acquire(&self, op: &'static str, capability: Capabilities) -> Result<BusyGuard> {
        if !self.capabilities.contains(capability) {
            return Err(Error::UnsupportedOperation {
                backend: self.key.backend.clone(),
                operation: op,
            });
        }
        self.check_usable()?;

        let lock = Arc::clone(&self.lock).lock_owned().await;
        debug!(worker = %self.key, op, "Acquired worker lock");
        self.enter(lock, !capability.is_empty())
    }

    fn enter(&self, lock: OwnedMutexGuard<()>, record: bool) -> Result<BusyGuard> {
        // re-check: the handle may have been stopped while we queued
        self.check_usable()?;
        if !self.process_alive() {
            let reason = self
                .process
                .as_ref()
                .and_then(WorkerProcess::exit_reason)
                .map(|r| r.to_string())
                .unwrap_or_else(|| "exited".to_string());
            self.status.lock().set_error();
            warn!(worker = %self.key, "Worker process {}", reason);
            return Err(Error::ConnectionLost(format!(
                "worker for {} {}",
                self.key, reason
            )));
        }

        self.status.lock().set_busy();
        Ok(BusyGuard {
            status: Arc::clone(&self.status),
            key: self.key.clone(),
            record,
            _lock: lock,
        })
    }

    fn check_usable(&self) -> Result<()> {
        match self.state() {
            WorkerState::Unloaded => Err(Error::ConnectionLost(format!(
                "worker for {} was stopped",
                self.key
            ))),
            WorkerState::Error => Err(Error::ConnectionLost(format!(
                "worker for {} is in error state",
                self.key
            ))),
            _ => Ok(()),
        }
    }

    fn process_alive(&self) -> bool {
        self.process.as_ref().map_or(true, WorkerProcess::is_alive)
    }

    /// The caller's deadline, or the default one
    fn deadline(&self, requested: Option<Duration>) -> Option<Duration> {
        requested.or(self.settings.call_timeout)
    }

    async fn with_deadline<T>(
        &self,
        deadline: Option<Duration>,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match deadline.or(self.settings.call_timeout) {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| Err(Error::Timeout(limit))),
            None => call.await,
        }
    }

    fn observe<T>(&self, guard: &BusyGuard, result: Result<T>) -> Result<T> {
        if let Err(Error::ConnectionLost(reason)) = &result {
            warn!(worker = %self.key, "Connection to worker lost: {}", reason);
            guard.fail();
        }
        result
    }
}
