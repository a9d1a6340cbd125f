//! Common test utilities
//!
//! An in-process fake backend and launcher. The fake counts launches and
//! loads, records prediction options, sleeps per operation, and flags any
//! two operations that overlap inside one worker.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

use localgate_core::config::ConfigDefaults;
use localgate_core::model_registry::ModelKey;
use localgate_core::proto;
use localgate_core::proto::status_response::State;
use localgate_core::{
    Backend, BackendConfig, BackendFactory, BackendLauncher, Capabilities, ConfigLoader,
    Dispatcher, Error, Registry, RegistryConfig, Result, SpawnedWorker,
};

pub const FAKE_LLM: &str = "fake-llm";
pub const FAKE_TTS: &str = "fake-tts";

/// Counters shared by a launcher and every backend it creates
#[derive(Default)]
pub struct Probe {
    pub launches: AtomicUsize,
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub calls: AtomicUsize,
    busy: AtomicBool,
    overlapped: AtomicBool,
    /// Make the next operation fail as if the worker hung up
    pub hang_up: AtomicBool,
    pub predictions: Mutex<Vec<proto::PredictOptions>>,
}

impl Probe {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether two operations ever ran at once inside one worker
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn last_prediction(&self) -> Option<proto::PredictOptions> {
        self.predictions.lock().last().cloned()
    }
}

/// Marks the fake worker busy until dropped, even when the call is cancelled
struct InFlight(Arc<Probe>);

impl InFlight {
    fn enter(probe: &Arc<Probe>) -> Self {
        if probe.busy.swap(true, Ordering::SeqCst) {
            probe.overlapped.store(true, Ordering::SeqCst);
        }
        probe.calls.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(probe))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

pub struct FakeBackend {
    probe: Arc<Probe>,
    load_delay: Duration,
    op_delay: Duration,
}

impl FakeBackend {
    async fn op(&self) -> Result<()> {
        let _in_flight = InFlight::enter(&self.probe);
        tokio::time::sleep(self.op_delay).await;
        if self.probe.hang_up.swap(false, Ordering::SeqCst) {
            return Err(Error::ConnectionLost("fake worker hung up".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn health(&self) -> Result<String> {
        Ok("OK".to_string())
    }

    async fn load(&self, options: proto::ModelOptions) -> Result<()> {
        tokio::time::sleep(self.load_delay).await;
        self.probe.loads.fetch_add(1, Ordering::SeqCst);
        if options.model.contains("broken") {
            return Err(Error::LoadFailed(options.model, "corrupt weights".to_string()));
        }
        Ok(())
    }

    async fn predict(
        &self,
        options: proto::PredictOptions,
        _deadline: Option<Duration>,
    ) -> Result<String> {
        self.op().await?;
        let reply = options.prompt.clone();
        self.probe.predictions.lock().push(options);
        Ok(reply)
    }

    async fn predict_stream(
        &self,
        options: proto::PredictOptions,
        _deadline: Option<Duration>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let words: Vec<String> = options
            .prompt
            .split_whitespace()
            .map(str::to_string)
            .collect();
        self.probe.predictions.lock().push(options);
        let delay = self.op_delay;

        // the worker stays busy until the last chunk or until abandoned
        let in_flight = InFlight::enter(&self.probe);
        let chunks = stream::unfold(
            (words.into_iter(), in_flight),
            move |(mut words, in_flight)| async move {
                let word = words.next()?;
                tokio::time::sleep(delay).await;
                Some((Ok(word), (words, in_flight)))
            },
        );
        Ok(chunks.boxed())
    }

    async fn embed(
        &self,
        options: proto::PredictOptions,
        _deadline: Option<Duration>,
    ) -> Result<Vec<f32>> {
        self.op().await?;
        Ok(vec![options.embeddings.len() as f32, 1.0])
    }

    async fn transcribe(
        &self,
        request: proto::TranscriptRequest,
        _deadline: Option<Duration>,
    ) -> Result<proto::TranscriptResult> {
        self.op().await?;
        Ok(proto::TranscriptResult {
            segments: Vec::new(),
            text: request.dst,
        })
    }

    async fn synthesize(
        &self,
        request: proto::TtsRequest,
        _deadline: Option<Duration>,
    ) -> Result<()> {
        self.op().await?;
        let body = format!("{}|{}", request.voice, request.text);
        tokio::fs::write(&request.dst, body).await?;
        Ok(())
    }

    async fn generate_image(
        &self,
        request: proto::GenerateImageRequest,
        _deadline: Option<Duration>,
    ) -> Result<()> {
        self.op().await?;
        tokio::fs::write(&request.dst, request.positive_prompt).await?;
        Ok(())
    }

    async fn status(&self, _deadline: Option<Duration>) -> Result<proto::StatusResponse> {
        let mut response = proto::StatusResponse {
            state: 0,
            memory: Some(proto::MemoryUsageData {
                total: 4096,
                breakdown: HashMap::from([("weights".to_string(), 4096)]),
            }),
        };
        response.set_state(State::Ready);
        Ok(response)
    }

    async fn unload(&self) -> Result<()> {
        self.probe.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Launches [`FakeBackend`]s in process
pub struct FakeLauncher {
    pub probe: Arc<Probe>,
    pub load_delay: Duration,
    pub op_delay: Duration,
    pub fail_spawn: bool,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            probe: Arc::new(Probe::default()),
            load_delay: Duration::from_millis(10),
            op_delay: Duration::from_millis(10),
            fail_spawn: false,
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_spawn = true;
        self
    }
}

#[async_trait]
impl BackendLauncher for FakeLauncher {
    async fn launch(&self, key: &ModelKey, _config: &BackendConfig) -> Result<SpawnedWorker> {
        self.probe.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_spawn {
            return Err(Error::BackendSpawnFailed {
                backend: key.backend.clone(),
                reason: "executable missing".to_string(),
            });
        }
        Ok(SpawnedWorker::in_process(Arc::new(FakeBackend {
            probe: Arc::clone(&self.probe),
            load_delay: self.load_delay,
            op_delay: self.op_delay,
        })))
    }
}

/// Factory registering `launcher` under the fake LLM and TTS tags
pub fn fake_factory(launcher: Arc<FakeLauncher>) -> BackendFactory {
    BackendFactory::new()
        .with_backend(
            FAKE_LLM,
            Capabilities::PREDICT | Capabilities::STREAM | Capabilities::EMBED,
            launcher.clone(),
        )
        .with_backend(FAKE_TTS, Capabilities::TTS, launcher)
}

pub fn fake_registry(launcher: Arc<FakeLauncher>, config: RegistryConfig) -> Arc<Registry> {
    Arc::new(Registry::new(config, fake_factory(launcher)))
}

/// Record for `model_file` served by the fake LLM backend
pub fn llm_config(model_file: &str) -> BackendConfig {
    let mut config = BackendConfig::for_model_file(model_file);
    config.backend = FAKE_LLM.to_string();
    config
}

/// Model records used by the dispatch tests
pub const MODELS_YAML: &str = r#"
- name: gpt-local
  backend: fake-llm
  parameters:
    model: gpt.bin
    temperature: 0.7
- name: voice
  backend: fake-tts
  parameters:
    model: voice.onnx
  extensions:
    tts:
      voice: amy
- name: broken-llm
  backend: fake-llm
  parameters:
    model: broken.bin
"#;

/// Dispatcher over the fake backends with [`MODELS_YAML`] in `root/models`
pub fn fake_dispatcher(root: &Path, launcher: Arc<FakeLauncher>) -> Dispatcher {
    let models = root.join("models");
    std::fs::create_dir_all(&models).unwrap();
    std::fs::write(models.join("models.yaml"), MODELS_YAML).unwrap();

    let loader = ConfigLoader::new(&models, ConfigDefaults::default());
    loader.load_from_path(&models).unwrap();

    let registry = fake_registry(launcher, RegistryConfig::new().with_models_path(&models));
    Dispatcher::new(
        Arc::new(loader),
        registry,
        root.join("generated").join("audio"),
        root.join("generated").join("images"),
    )
}
