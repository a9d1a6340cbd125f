//! Per-model backend configuration records
//!
//! One [`BackendConfig`] exists per model name. Records are read-only once
//! resolved; per-request overrides always produce a derived copy.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::proto;
use crate::{Error, Result};

/// Default nucleus sampling threshold
pub const DEFAULT_TOP_P: f32 = 0.7;
/// Default top-k sampling width
pub const DEFAULT_TOP_K: i32 = 80;
/// Default completion length in tokens
pub const DEFAULT_MAX_TOKENS: i32 = 512;
/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.9;

fn default_top_p() -> f32 {
    DEFAULT_TOP_P
}

fn default_top_k() -> i32 {
    DEFAULT_TOP_K
}

fn default_max_tokens() -> i32 {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

/// Whether `tag` can name a worker executable: a single plain path component
pub fn is_valid_backend_tag(tag: &str) -> bool {
    let mut components = Path::new(tag).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}

/// Whether the relative path `file` stays inside the directory it is joined to
pub fn is_contained_path(file: &str) -> bool {
    !file.is_empty()
        && Path::new(file)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Default prediction parameters (the `parameters:` block)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOptions {
    /// Model file, relative to the models directory
    #[serde(default)]
    pub model: String,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_top_k")]
    pub top_k: i32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: i32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Fixed seed; `None` lets the worker pick one
    #[serde(default)]
    pub seed: Option<i32>,

    #[serde(default)]
    pub repeat_penalty: f32,

    #[serde(default)]
    pub frequency_penalty: f32,

    #[serde(default)]
    pub presence_penalty: f32,

    #[serde(default)]
    pub mirostat: i32,

    #[serde(default)]
    pub mirostat_eta: f32,

    #[serde(default)]
    pub mirostat_tau: f32,

    #[serde(default)]
    pub n_keep: i32,

    #[serde(default)]
    pub ignore_eos: bool,

    /// Stop sequences
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for PredictionOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            seed: None,
            repeat_penalty: 0.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: 0,
            mirostat_eta: 0.0,
            mirostat_tau: 0.0,
            n_keep: 0,
            ignore_eos: false,
            stop: Vec::new(),
        }
    }
}

/// Runtime tuning options, flattened into the top level of a record
///
/// Fields left as `None` pick up gateway-wide defaults at load time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    #[serde(default)]
    pub context_size: Option<i32>,

    #[serde(default)]
    pub threads: Option<i32>,

    #[serde(default)]
    pub f16: Option<bool>,

    #[serde(default)]
    pub mmap: Option<bool>,

    #[serde(default)]
    pub mlock: bool,

    #[serde(default)]
    pub gpu_layers: i32,

    #[serde(default)]
    pub main_gpu: String,

    #[serde(default)]
    pub tensor_split: String,

    #[serde(default)]
    pub low_vram: bool,

    #[serde(default)]
    pub numa: bool,

    #[serde(default)]
    pub batch: i32,

    /// Load the model in embeddings mode
    #[serde(default)]
    pub embeddings: bool,

    /// GBNF grammar applied to every prediction
    #[serde(default)]
    pub grammar: String,

    #[serde(default)]
    pub prompt_cache_path: String,

    #[serde(default)]
    pub prompt_cache_all: bool,

    #[serde(default)]
    pub prompt_cache_ro: bool,

    #[serde(default)]
    pub lora_adapter: String,

    #[serde(default)]
    pub lora_base: String,

    #[serde(default)]
    pub lora_scale: f32,

    #[serde(default)]
    pub rope_scaling: String,

    #[serde(default)]
    pub mmproj: String,

    #[serde(default)]
    pub draft_model: String,

    /// Architecture hint for backends that host several model classes
    #[serde(default, rename = "type")]
    pub model_type: String,

    #[serde(default)]
    pub quantization: String,

    #[serde(default)]
    pub cuda: bool,
}

/// Connection retry policy for this model's worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcOptions {
    /// Connection attempts before giving up
    #[serde(default)]
    pub attempts: Option<u32>,

    /// Seconds to sleep between attempts
    #[serde(default)]
    pub attempts_sleep_time: Option<u64>,
}

/// Diffusion pipeline options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffusersOptions {
    #[serde(default)]
    pub pipeline_type: String,

    #[serde(default)]
    pub scheduler_type: String,

    #[serde(default)]
    pub cfg_scale: f32,

    #[serde(default)]
    pub img2img: bool,

    #[serde(default)]
    pub clip_skip: i32,

    #[serde(default)]
    pub clip_model: String,

    #[serde(default)]
    pub control_net: String,

    /// Inference steps per image
    #[serde(default)]
    pub step: i32,
}

/// Speech synthesis options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsOptions {
    #[serde(default)]
    pub voice: String,

    #[serde(default)]
    pub language: String,

    /// Reference audio for voice-cloning backends
    #[serde(default)]
    pub audio_path: String,
}

/// Backend-family specific options
///
/// Anything a family needs beyond the core record lives here instead of on
/// [`BackendConfig`] itself. `options` is passed to the worker verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extensions {
    #[serde(default)]
    pub diffusers: Option<DiffusersOptions>,

    #[serde(default)]
    pub tts: Option<TtsOptions>,

    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Persisted configuration for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Public model name requests refer to
    pub name: String,

    /// Backend type tag (`llama-cpp`, `whisper`, `piper`, ...)
    #[serde(default)]
    pub backend: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub parameters: PredictionOptions,

    #[serde(flatten)]
    pub runtime: RuntimeOptions,

    #[serde(default)]
    pub grpc: GrpcOptions,

    #[serde(default)]
    pub extensions: Extensions,
}

/// Gateway-wide values applied to records that leave them unset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfigDefaults {
    pub threads: i32,
    pub context_size: i32,
    pub f16: bool,
}

impl Default for ConfigDefaults {
    fn default() -> Self {
        Self {
            threads: num_cpus::get_physical() as i32,
            context_size: 512,
            f16: false,
        }
    }
}

/// Per-request overrides
///
/// Only this allow-listed subset of a record can be changed by a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOverrides {
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<i32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
    #[serde(default)]
    pub seed: Option<i32>,
}

impl RequestOverrides {
    /// Override the backend tag
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Override the model file, relative to the models directory
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Override the sampling temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Override the TTS voice
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    /// Override the TTS language
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl BackendConfig {
    /// Record for a raw model file with every default applied
    pub fn for_model_file(model_file: impl Into<String>) -> Self {
        let model_file = model_file.into();
        Self {
            name: model_file.clone(),
            backend: String::new(),
            description: String::new(),
            parameters: PredictionOptions {
                model: model_file,
                ..Default::default()
            },
            runtime: RuntimeOptions::default(),
            grpc: GrpcOptions::default(),
            extensions: Extensions::default(),
        }
    }

    /// Model file the worker loads
    pub fn model_file(&self) -> &str {
        if self.parameters.model.is_empty() {
            &self.name
        } else {
            &self.parameters.model
        }
    }

    /// Fill unset runtime options from gateway defaults
    pub fn apply_defaults(&mut self, defaults: &ConfigDefaults) {
        let runtime = &mut self.runtime;
        if runtime.threads.map_or(true, |t| t == 0) {
            runtime.threads = Some(defaults.threads);
        }
        if runtime.context_size.map_or(true, |c| c == 0) {
            runtime.context_size = Some(defaults.context_size);
        }
        if runtime.f16.is_none() {
            runtime.f16 = Some(defaults.f16);
        }
        if runtime.mmap.is_none() {
            runtime.mmap = Some(true);
        }
    }

    /// Check the enumerated core field set
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("model name is empty".to_string()));
        }
        if !self.backend.is_empty() && !is_valid_backend_tag(&self.backend) {
            return Err(Error::InvalidConfig(format!(
                "model {}: invalid backend tag {:?}",
                self.name, self.backend
            )));
        }
        if self.model_file().trim().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "model {} has no model file",
                self.name
            )));
        }
        let p = &self.parameters;
        if !(0.0..=1.0).contains(&p.top_p) {
            return Err(Error::InvalidConfig(format!(
                "model {}: top_p {} outside [0, 1]",
                self.name, p.top_p
            )));
        }
        if p.temperature < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "model {}: negative temperature {}",
                self.name, p.temperature
            )));
        }
        if p.top_k < 0 || p.max_tokens < 0 {
            return Err(Error::InvalidConfig(format!(
                "model {}: top_k and max_tokens must be non-negative",
                self.name
            )));
        }
        if self.runtime.threads.is_some_and(|t| t <= 0) {
            return Err(Error::InvalidConfig(format!(
                "model {}: threads must be positive",
                self.name
            )));
        }
        if self.runtime.context_size.is_some_and(|c| c <= 0) {
            return Err(Error::InvalidConfig(format!(
                "model {}: context_size must be positive",
                self.name
            )));
        }
        Ok(())
    }

    /// Derived copy with request overrides applied
    pub fn with_overrides(&self, overrides: &RequestOverrides) -> BackendConfig {
        let mut cfg = self.clone();
        if let Some(backend) = overrides.backend.as_ref().filter(|b| !b.is_empty()) {
            cfg.backend = backend.clone();
        }
        if let Some(model) = overrides.model.as_ref().filter(|m| !m.is_empty()) {
            cfg.parameters.model = model.clone();
        }
        if overrides.voice.is_some() || overrides.language.is_some() {
            let tts = cfg.extensions.tts.get_or_insert_with(TtsOptions::default);
            if let Some(voice) = &overrides.voice {
                tts.voice = voice.clone();
            }
            if let Some(language) = &overrides.language {
                tts.language = language.clone();
            }
        }
        if let Some(t) = overrides.temperature {
            cfg.parameters.temperature = t;
        }
        if let Some(p) = overrides.top_p {
            cfg.parameters.top_p = p;
        }
        if let Some(k) = overrides.top_k {
            cfg.parameters.top_k = k;
        }
        if let Some(n) = overrides.max_tokens {
            cfg.parameters.max_tokens = n;
        }
        if let Some(seed) = overrides.seed {
            cfg.parameters.seed = Some(seed);
        }
        cfg
    }

    /// Options sent with the worker's `LoadModel` call
    ///
    /// Only startup-affecting settings go here; these also feed the
    /// [`ModelKey`](crate::model_registry::ModelKey) fingerprint.
    pub fn model_options(&self, models_path: &Path) -> proto::ModelOptions {
        let rt = &self.runtime;
        let model_file = self.model_file();
        let diffusers = self.extensions.diffusers.clone().unwrap_or_default();
        let audio_path = self
            .extensions
            .tts
            .as_ref()
            .map(|t| t.audio_path.clone())
            .unwrap_or_default();

        proto::ModelOptions {
            model: model_file.to_string(),
            model_file: models_path.join(model_file).to_string_lossy().into_owned(),
            model_path: models_path.to_string_lossy().into_owned(),
            context_size: rt.context_size.unwrap_or_default(),
            seed: self.parameters.seed.unwrap_or_default(),
            n_batch: rt.batch,
            f16_memory: rt.f16.unwrap_or_default(),
            mlock: rt.mlock,
            mmap: rt.mmap.unwrap_or(true),
            embeddings: rt.embeddings,
            numa: rt.numa,
            n_gpu_layers: rt.gpu_layers,
            main_gpu: rt.main_gpu.clone(),
            tensor_split: rt.tensor_split.clone(),
            threads: rt.threads.unwrap_or_default(),
            low_vram: rt.low_vram,
            lora_adapter: rt.lora_adapter.clone(),
            lora_base: rt.lora_base.clone(),
            lora_scale: rt.lora_scale,
            rope_scaling: rt.rope_scaling.clone(),
            mmproj: rt.mmproj.clone(),
            draft_model: rt.draft_model.clone(),
            model_type: rt.model_type.clone(),
            quantization: rt.quantization.clone(),
            cuda: rt.cuda,
            prompt_cache_path: rt.prompt_cache_path.clone(),
            prompt_cache_all: rt.prompt_cache_all,
            prompt_cache_ro: rt.prompt_cache_ro,
            audio_path,
            pipeline_type: diffusers.pipeline_type,
            scheduler_type: diffusers.scheduler_type,
            cfg_scale: diffusers.cfg_scale,
            img2img: diffusers.img2img,
            clip_skip: diffusers.clip_skip,
            clip_model: diffusers.clip_model,
            control_net: diffusers.control_net,
            options: self
                .extensions
                .options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Options sent with `Predict`/`PredictStream`/`Embedding` calls
    pub fn predict_options(&self, prompt: impl Into<String>) -> proto::PredictOptions {
        let p = &self.parameters;
        let rt = &self.runtime;
        proto::PredictOptions {
            prompt: prompt.into(),
            seed: p.seed.unwrap_or(-1),
            threads: rt.threads.unwrap_or_default(),
            tokens: p.max_tokens,
            top_k: p.top_k,
            top_p: p.top_p,
            temperature: p.temperature,
            repeat_penalty: p.repeat_penalty,
            frequency_penalty: p.frequency_penalty,
            presence_penalty: p.presence_penalty,
            mirostat: p.mirostat,
            mirostat_eta: p.mirostat_eta,
            mirostat_tau: p.mirostat_tau,
            n_keep: p.n_keep,
            ignore_eos: p.ignore_eos,
            stop_prompts: p.stop.clone(),
            grammar: rt.grammar.clone(),
            embeddings: String::new(),
            prompt_cache_all: rt.prompt_cache_all,
            prompt_cache_ro: rt.prompt_cache_ro,
        }
    }

    /// Voice and language for speech synthesis
    pub fn tts(&self) -> TtsOptions {
        self.extensions.tts.clone().unwrap_or_default()
    }

    /// Diffusion step count, if configured
    pub fn image_steps(&self) -> i32 {
        self.extensions
            .diffusers
            .as_ref()
            .map(|d| d.step)
            .unwrap_or_default()
    }
}
