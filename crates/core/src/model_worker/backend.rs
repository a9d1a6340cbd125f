//! Backend interface and registered constructors
//!
//! Every backend type implements the same [`Backend`] operation set. The
//! locking and state machine live once in [`WorkerHandle`](super::WorkerHandle),
//! which wraps any implementation. Constructors are looked up by backend tag
//! in a [`BackendFactory`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
use futures::stream::BoxStream;

use crate::config::BackendConfig;
use crate::model_registry::ModelKey;
use crate::process::WorkerProcess;
use crate::proto;
use crate::{Error, Result};

bitflags! {
    /// Operations a backend type implements
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const PREDICT = 1 << 0;
        const STREAM = 1 << 1;
        const EMBED = 1 << 2;
        const TRANSCRIBE = 1 << 3;
        const TTS = 1 << 4;
        const IMAGE = 1 << 5;
    }
}

impl Capabilities {
    /// Built-in capability sets for the known backend tags
    pub fn for_tag(tag: &str) -> Option<Capabilities> {
        let caps = match tag {
            "llama-cpp" | "transformers" => {
                Capabilities::PREDICT | Capabilities::STREAM | Capabilities::EMBED
            }
            "whisper" => Capabilities::TRANSCRIBE,
            "piper" | "bark" => Capabilities::TTS,
            "diffusers" | "stablediffusion" => Capabilities::IMAGE,
            _ => return None,
        };
        Some(caps)
    }
}

/// The operation set every worker implementation provides
///
/// Implementations are not expected to be reentrant; the owning handle
/// never issues two calls at once, except `status` and `unload` during
/// teardown which are issued under the same lock.
///
/// `deadline` is the caller's budget for the call. The handle enforces it
/// locally as well; implementations forward it to the worker when the
/// transport can carry it.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Readiness probe; a healthy worker answers `"OK"`
    async fn health(&self) -> Result<String>;

    /// Load the model described by `options`
    async fn load(&self, options: proto::ModelOptions) -> Result<()>;

    async fn predict(
        &self,
        options: proto::PredictOptions,
        deadline: Option<Duration>,
    ) -> Result<String>;

    /// Ordered, finite sequence of partial completions
    async fn predict_stream(
        &self,
        options: proto::PredictOptions,
        deadline: Option<Duration>,
    ) -> Result<BoxStream<'static, Result<String>>>;

    async fn embed(
        &self,
        options: proto::PredictOptions,
        deadline: Option<Duration>,
    ) -> Result<Vec<f32>>;

    async fn transcribe(
        &self,
        request: proto::TranscriptRequest,
        deadline: Option<Duration>,
    ) -> Result<proto::TranscriptResult>;

    /// Write synthesized speech to `request.dst`
    async fn synthesize(&self, request: proto::TtsRequest, deadline: Option<Duration>) -> Result<()>;

    /// Write a generated image to `request.dst`
    async fn generate_image(
        &self,
        request: proto::GenerateImageRequest,
        deadline: Option<Duration>,
    ) -> Result<()>;

    async fn status(&self, deadline: Option<Duration>) -> Result<proto::StatusResponse>;

    async fn unload(&self) -> Result<()>;
}

/// A freshly launched worker, connected but not yet loaded
pub struct SpawnedWorker {
    pub backend: Arc<dyn Backend>,
    /// The OS process, when the backend runs out of process
    pub process: Option<WorkerProcess>,
}

impl SpawnedWorker {
    /// Worker without an OS process of its own
    pub fn in_process(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            process: None,
        }
    }
}

/// Starts a worker for a model and returns a connected backend
#[async_trait]
pub trait BackendLauncher: Send + Sync + 'static {
    async fn launch(&self, key: &ModelKey, config: &BackendConfig) -> Result<SpawnedWorker>;
}

#[derive(Clone)]
struct Registration {
    capabilities: Capabilities,
    launcher: Arc<dyn BackendLauncher>,
}

/// Registered constructors keyed by backend tag
#[derive(Clone, Default)]
pub struct BackendFactory {
    backends: HashMap<String, Registration>,
    fallback: Option<Registration>,
}

impl BackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `tag`, replacing any previous one
    pub fn register(
        &mut self,
        tag: impl Into<String>,
        capabilities: Capabilities,
        launcher: Arc<dyn BackendLauncher>,
    ) -> &mut Self {
        self.backends.insert(
            tag.into(),
            Registration {
                capabilities,
                launcher,
            },
        );
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_backend(
        mut self,
        tag: impl Into<String>,
        capabilities: Capabilities,
        launcher: Arc<dyn BackendLauncher>,
    ) -> Self {
        self.register(tag, capabilities, launcher);
        self
    }

    /// Constructor used for tags with no registration of their own
    pub fn with_fallback(
        mut self,
        capabilities: Capabilities,
        launcher: Arc<dyn BackendLauncher>,
    ) -> Self {
        self.fallback = Some(Registration {
            capabilities,
            launcher,
        });
        self
    }

    /// Factory that launches every backend as a gRPC worker process
    ///
    /// Known tags get their built-in capability set. Any other tag, including
    /// configured external backends, gets every capability and the worker
    /// decides what it supports.
    pub fn grpc(launcher: Arc<dyn BackendLauncher>) -> Self {
        let mut factory = Self::new();
        for tag in [
            "llama-cpp",
            "transformers",
            "whisper",
            "piper",
            "bark",
            "diffusers",
            "stablediffusion",
        ] {
            if let Some(caps) = Capabilities::for_tag(tag) {
                factory.register(tag, caps, Arc::clone(&launcher));
            }
        }
        factory.with_fallback(Capabilities::all(), launcher)
    }

    /// Capability set for `tag`, if the tag can be launched
    pub fn capabilities(&self, tag: &str) -> Option<Capabilities> {
        self.registration(tag).map(|r| r.capabilities)
    }

    pub(crate) fn resolve(&self, tag: &str) -> Result<(Capabilities, Arc<dyn BackendLauncher>)> {
        self.registration(tag)
            .map(|r| (r.capabilities, Arc::clone(&r.launcher)))
            .ok_or_else(|| Error::BackendSpawnFailed {
                backend: tag.to_string(),
                reason: "no constructor registered for backend".to_string(),
            })
    }

    fn registration(&self, tag: &str) -> Option<&Registration> {
        self.backends.get(tag).or(self.fallback.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverLauncher;

    #[async_trait]
    impl BackendLauncher for NeverLauncher {
        async fn launch(&self, key: &ModelKey, _config: &BackendConfig) -> Result<SpawnedWorker> {
            Err(Error::BackendSpawnFailed {
                backend: key.backend.clone(),
                reason: "never".to_string(),
            })
        }
    }

    #[test]
    fn test_default_capabilities() {
        let factory = BackendFactory::grpc(Arc::new(NeverLauncher));
        assert_eq!(
            factory.capabilities("whisper"),
            Some(Capabilities::TRANSCRIBE)
        );
        assert!(factory
            .capabilities("llama-cpp")
            .unwrap()
            .contains(Capabilities::STREAM));
        assert_eq!(factory.capabilities("my-external"), Some(Capabilities::all()));
    }

    #[test]
    fn test_unregistered_tag_without_fallback() {
        let factory =
            BackendFactory::new().with_backend("piper", Capabilities::TTS, Arc::new(NeverLauncher));
        assert!(factory.resolve("piper").is_ok());
        assert!(matches!(
            factory.resolve("bark"),
            Err(Error::BackendSpawnFailed { .. })
        ));
    }
}
