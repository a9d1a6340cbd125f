//! Dispatch facade
//!
//! The single entry point request handlers use: resolve the model's config,
//! get or create its worker, run the operation, return the result. Speech
//! and image operations write their artifact to a staging directory and
//! return its path; relocating it is the caller's job.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{BackendConfig, ConfigLoader, GatewayConfig, RequestOverrides};
use crate::model_registry::Registry;
use crate::model_worker::{Capabilities, TokenStream, WorkerHandle};
use crate::monitor::BackendMonitor;
use crate::proto;
use crate::{Error, Result};

/// Operations the facade can run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Predict,
    PredictStream,
    Embed,
    Transcribe,
    Synthesize,
    GenerateImage,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Predict => "predict",
            Operation::PredictStream => "predict_stream",
            Operation::Embed => "embed",
            Operation::Transcribe => "transcribe",
            Operation::Synthesize => "synthesize",
            Operation::GenerateImage => "generate_image",
        }
    }

    /// Capability a backend needs for this operation
    pub fn capability(self) -> Capabilities {
        match self {
            Operation::Predict => Capabilities::PREDICT,
            Operation::PredictStream => Capabilities::STREAM,
            Operation::Embed => Capabilities::EMBED,
            Operation::Transcribe => Capabilities::TRANSCRIBE,
            Operation::Synthesize => Capabilities::TTS,
            Operation::GenerateImage => Capabilities::IMAGE,
        }
    }
}

/// Image generation parameters
#[derive(Debug, Clone, Default)]
pub struct ImageRequest {
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub width: i32,
    pub height: i32,
    /// Inference steps; the model's configured count when unset
    pub step: Option<i32>,
    pub seed: Option<i32>,
    /// Source image for image-to-image pipelines
    pub src: Option<PathBuf>,
}

/// Operation input
#[derive(Debug, Clone)]
pub enum Payload {
    Predict { prompt: String },
    PredictStream { prompt: String },
    Embed { input: String },
    Transcribe {
        audio: PathBuf,
        language: Option<String>,
        translate: bool,
    },
    /// Voice and language come from the model config or overrides
    Synthesize { text: String },
    GenerateImage(ImageRequest),
}

impl Payload {
    pub fn operation(&self) -> Operation {
        match self {
            Payload::Predict { .. } => Operation::Predict,
            Payload::PredictStream { .. } => Operation::PredictStream,
            Payload::Embed { .. } => Operation::Embed,
            Payload::Transcribe { .. } => Operation::Transcribe,
            Payload::Synthesize { .. } => Operation::Synthesize,
            Payload::GenerateImage(_) => Operation::GenerateImage,
        }
    }
}

/// Operation result
#[derive(Debug)]
pub enum Output {
    Text(String),
    Stream(TokenStream),
    Embedding(Vec<f32>),
    Transcript(proto::TranscriptResult),
    /// Path of a staged artifact (speech or image)
    File(PathBuf),
}

impl Output {
    pub fn into_text(self) -> Option<String> {
        match self {
            Output::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<TokenStream> {
        match self {
            Output::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn into_file(self) -> Option<PathBuf> {
        match self {
            Output::File(path) => Some(path),
            _ => None,
        }
    }
}

/// One call into the facade
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Model name or raw model file
    pub model: String,
    pub payload: Payload,
    pub overrides: RequestOverrides,
    /// Caller deadline; the registry default applies when unset
    pub timeout: Option<Duration>,
}

impl InvokeRequest {
    pub fn new(model: impl Into<String>, payload: Payload) -> Self {
        Self {
            model: model.into(),
            payload,
            overrides: RequestOverrides::default(),
            timeout: None,
        }
    }

    pub fn predict(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            model,
            Payload::Predict {
                prompt: prompt.into(),
            },
        )
    }

    pub fn predict_stream(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            model,
            Payload::PredictStream {
                prompt: prompt.into(),
            },
        )
    }

    pub fn embed(model: impl Into<String>, input: impl Into<String>) -> Self {
        Self::new(
            model,
            Payload::Embed {
                input: input.into(),
            },
        )
    }

    pub fn synthesize(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(model, Payload::Synthesize { text: text.into() })
    }

    pub fn with_overrides(mut self, overrides: RequestOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Facade over config resolution, the registry and the workers
pub struct Dispatcher {
    loader: Arc<ConfigLoader>,
    registry: Arc<Registry>,
    audio_dir: PathBuf,
    image_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(
        loader: Arc<ConfigLoader>,
        registry: Arc<Registry>,
        audio_dir: impl Into<PathBuf>,
        image_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            loader,
            registry,
            audio_dir: audio_dir.into(),
            image_dir: image_dir.into(),
        }
    }

    /// Build the loader, registry and facade from gateway settings
    pub fn from_gateway_config(config: &GatewayConfig) -> Result<Self> {
        let loader = Arc::new(ConfigLoader::from_gateway(config)?);
        let registry = Arc::new(Registry::from_gateway(config));
        Ok(Self::new(
            loader,
            registry,
            config.audio_dir.clone(),
            config.image_dir.clone(),
        ))
    }

    pub fn loader(&self) -> &Arc<ConfigLoader> {
        &self.loader
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Monitor sharing this facade's loader and registry
    pub fn monitor(&self) -> BackendMonitor {
        BackendMonitor::new(Arc::clone(&self.loader), Arc::clone(&self.registry))
    }

    /// Resolve a model identifier to its effective config
    pub fn resolve(&self, model: &str, overrides: &RequestOverrides) -> Result<BackendConfig> {
        self.loader.resolve(model, overrides)
    }

    /// Resolve, get or create the worker, and run the operation
    ///
    /// A `ConnectionLost` failure evicts the worker before it is returned, so
    /// retrying the request spawns a fresh one.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<Output> {
        let operation = request.payload.operation();
        let config = self.loader.resolve(&request.model, &request.overrides)?;

        // refuse before spawning anything
        if let Some(caps) = self.registry.factory().capabilities(&config.backend) {
            if !caps.contains(operation.capability()) {
                return Err(Error::UnsupportedOperation {
                    backend: config.backend.clone(),
                    operation: operation.name(),
                });
            }
        }

        let handle = self.registry.get_or_create(&config).await?;
        debug!(model = %request.model, worker = %handle.key(), op = operation.name(), "Dispatching");

        let result = self
            .run(&handle, &config, request.payload, request.timeout)
            .await;

        if let Err(Error::ConnectionLost(reason)) = &result {
            warn!(worker = %handle.key(), "Worker connection lost, evicting: {}", reason);
            self.registry.evict(&handle).await;
        }
        result
    }

    async fn run(
        &self,
        handle: &WorkerHandle,
        config: &BackendConfig,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<Output> {
        match payload {
            Payload::Predict { prompt } => handle
                .predict(config.predict_options(prompt), timeout)
                .await
                .map(Output::Text),
            Payload::PredictStream { prompt } => handle
                .predict_stream(config.predict_options(prompt), timeout)
                .await
                .map(Output::Stream),
            Payload::Embed { input } => {
                let mut options = config.predict_options(input.clone());
                options.embeddings = input;
                handle.embed(options, timeout).await.map(Output::Embedding)
            }
            Payload::Transcribe {
                audio,
                language,
                translate,
            } => {
                let request = proto::TranscriptRequest {
                    dst: audio.to_string_lossy().into_owned(),
                    language: language.unwrap_or_default(),
                    threads: config.runtime.threads.unwrap_or_default().max(0) as u32,
                    translate,
                };
                handle
                    .transcribe(request, timeout)
                    .await
                    .map(Output::Transcript)
            }
            Payload::Synthesize { text } => {
                let dst = staging_path(&self.audio_dir, "tts_", "wav").await?;
                let tts = config.tts();
                let request = proto::TtsRequest {
                    text,
                    model: self
                        .loader
                        .models_path()
                        .join(config.model_file())
                        .to_string_lossy()
                        .into_owned(),
                    dst: dst.to_string_lossy().into_owned(),
                    voice: tts.voice,
                    language: tts.language,
                };
                handle.synthesize(request, timeout).await?;
                Ok(Output::File(dst))
            }
            Payload::GenerateImage(image) => {
                let dst = staging_path(&self.image_dir, "b64", "png").await?;
                let request = proto::GenerateImageRequest {
                    height: image.height,
                    width: image.width,
                    mode: 0,
                    step: image.step.unwrap_or_else(|| config.image_steps()),
                    seed: image.seed.or(config.parameters.seed).unwrap_or(-1),
                    positive_prompt: image.positive_prompt,
                    negative_prompt: image.negative_prompt,
                    dst: dst.to_string_lossy().into_owned(),
                    src: image
                        .src
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                };
                handle.generate_image(request, timeout).await?;
                Ok(Output::File(dst))
            }
        }
    }
}

/// Fresh artifact path `<dir>/<prefix><uuid>.<ext>`, creating `dir` if needed
async fn staging_path(dir: &Path, prefix: &str, extension: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(dir.join(format!("{}{}.{}", prefix, Uuid::new_v4(), extension)))
}
