//! Config resolution
//!
//! Maps a model identifier to a validated [`BackendConfig`]. Records are
//! read from the models directory and cached until [`ConfigLoader::reload`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::backend::{is_contained_path, BackendConfig, ConfigDefaults, RequestOverrides};
use super::gateway::GatewayConfig;
use crate::{Error, Result};

/// Backend tag used when neither the record nor the request names one
pub const DEFAULT_BACKEND: &str = "llama-cpp";

/// Cached store of per-model records
pub struct ConfigLoader {
    models_path: PathBuf,
    defaults: ConfigDefaults,
    configs: RwLock<HashMap<String, Arc<BackendConfig>>>,
}

impl ConfigLoader {
    /// Create an empty loader rooted at `models_path`
    pub fn new(models_path: impl Into<PathBuf>, defaults: ConfigDefaults) -> Self {
        Self {
            models_path: models_path.into(),
            defaults,
            configs: RwLock::new(HashMap::new()),
        }
    }

    /// Create a loader from gateway settings and read the models directory
    pub fn from_gateway(config: &GatewayConfig) -> Result<Self> {
        let loader = Self::new(config.models_path.clone(), config.record_defaults());
        if loader.models_path.is_dir() {
            loader.load_from_path(&config.models_path)?;
        } else {
            warn!(
                path = %config.models_path.display(),
                "Models directory does not exist, starting with no records"
            );
        }
        Ok(loader)
    }

    pub fn models_path(&self) -> &Path {
        &self.models_path
    }

    pub fn defaults(&self) -> &ConfigDefaults {
        &self.defaults
    }

    /// Read every `*.yaml`/`*.yml` file in `dir` and merge the records
    ///
    /// A file may hold a single record or a list of records. Files that fail
    /// to parse or validate are skipped with a warning.
    pub fn load_from_path(&self, dir: &Path) -> Result<usize> {
        let records = self.read_records(dir)?;
        let count = records.len();
        let mut configs = self.configs.write();
        for cfg in records {
            if configs.contains_key(&cfg.name) {
                warn!(model = %cfg.name, path = %dir.display(), "Replacing previously loaded record");
            }
            configs.insert(cfg.name.clone(), Arc::new(cfg));
        }
        info!(path = %dir.display(), count, "Loaded model configs");
        Ok(count)
    }

    /// Re-read the models directory, replacing every cached record
    pub fn reload(&self) -> Result<usize> {
        let records = self.read_records(&self.models_path)?;
        let fresh: HashMap<_, _> = records
            .into_iter()
            .map(|cfg| (cfg.name.clone(), Arc::new(cfg)))
            .collect();
        let count = fresh.len();
        *self.configs.write() = fresh;
        info!(path = %self.models_path.display(), count, "Reloaded model configs");
        Ok(count)
    }

    /// Insert or replace a record in memory
    pub fn register(&self, mut config: BackendConfig) -> Result<()> {
        config.apply_defaults(&self.defaults);
        config.validate()?;
        self.configs
            .write()
            .insert(config.name.clone(), Arc::new(config));
        Ok(())
    }

    /// Stored record for `name`, without overrides or fallback
    pub fn get(&self, name: &str) -> Option<Arc<BackendConfig>> {
        self.configs.read().get(name).cloned()
    }

    /// All stored records, sorted by name
    pub fn list(&self) -> Vec<Arc<BackendConfig>> {
        let mut all: Vec<_> = self.configs.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Resolve `identifier` to a derived, validated record
    ///
    /// Falls back to treating `identifier` as a model file inside the models
    /// directory when no record exists. The stored record is never modified.
    pub fn resolve(&self, identifier: &str, overrides: &RequestOverrides) -> Result<BackendConfig> {
        if let Some(model) = overrides.model.as_deref().filter(|m| !m.is_empty()) {
            if !is_contained_path(model) {
                return Err(Error::InvalidConfig(format!(
                    "model file override {:?} leaves the models directory",
                    model
                )));
            }
        }
        let mut cfg = match self.get(identifier) {
            Some(stored) => stored.with_overrides(overrides),
            None => {
                let file = self
                    .model_file_fallback(identifier)
                    .ok_or_else(|| Error::ConfigNotFound(identifier.to_string()))?;
                debug!(model = identifier, "No stored config, using model file with defaults");
                let mut cfg = BackendConfig::for_model_file(file);
                cfg.apply_defaults(&self.defaults);
                cfg.with_overrides(overrides)
            }
        };
        if cfg.backend.is_empty() {
            cfg.backend = DEFAULT_BACKEND.to_string();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// `identifier` if it names a file inside the models directory
    fn model_file_fallback(&self, identifier: &str) -> Option<String> {
        if !is_contained_path(identifier) {
            return None;
        }
        self.models_path
            .join(identifier)
            .is_file()
            .then(|| identifier.to_string())
    }

    fn read_records(&self, dir: &Path) -> Result<Vec<BackendConfig>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
            })
            .collect();
        paths.sort();

        // one active record per name; later files win
        let mut records: Vec<BackendConfig> = Vec::new();
        let mut sources: HashMap<String, PathBuf> = HashMap::new();
        for path in paths {
            let found = match self.read_file(&path) {
                Ok(found) => found,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping model config");
                    continue;
                }
            };
            for cfg in found {
                if let Some(earlier) = sources.insert(cfg.name.clone(), path.clone()) {
                    warn!(
                        model = %cfg.name,
                        earlier = %earlier.display(),
                        later = %path.display(),
                        "Duplicate model name, the later record wins"
                    );
                    records.retain(|r| r.name != cfg.name);
                }
                records.push(cfg);
            }
        }
        Ok(records)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<BackendConfig>> {
        let content = std::fs::read_to_string(path)?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&content)?;
        let mut records: Vec<BackendConfig> = if doc.is_sequence() {
            serde_yaml::from_value(doc)?
        } else {
            vec![serde_yaml::from_value(doc)?]
        };
        for cfg in &mut records {
            cfg.apply_defaults(&self.defaults);
            cfg.validate()?;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn defaults() -> ConfigDefaults {
        ConfigDefaults {
            threads: 4,
            context_size: 1024,
            f16: false,
        }
    }

    fn loader_with(files: &[(&str, &str)]) -> (TempDir, ConfigLoader) {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        let loader = ConfigLoader::new(dir.path(), defaults());
        loader.load_from_path(dir.path()).unwrap();
        (dir, loader)
    }

    #[test]
    fn test_load_single_and_list_files() {
        let (_dir, loader) = loader_with(&[
            (
                "gpt.yaml",
                "name: gpt-local\nbackend: llama-cpp\nparameters:\n  model: gpt.gguf\n",
            ),
            (
                "voices.yml",
                "- name: amy\n  backend: piper\n  parameters: { model: amy.onnx }\n- name: bob\n  backend: piper\n  parameters: { model: bob.onnx }\n",
            ),
            ("notes.txt", "not a config"),
        ]);

        let names: Vec<_> = loader.list().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["amy", "bob", "gpt-local"]);

        let gpt = loader.get("gpt-local").unwrap();
        assert_eq!(gpt.runtime.threads, Some(4));
        assert_eq!(gpt.runtime.context_size, Some(1024));
    }

    #[test]
    fn test_invalid_file_is_skipped() {
        let (_dir, loader) = loader_with(&[
            ("good.yaml", "name: good\nparameters: { model: g.bin }\n"),
            ("bad.yaml", "name: bad\nparameters: { model: b.bin, top_p: 3.0 }\n"),
            ("broken.yaml", "name: [unterminated\n"),
        ]);
        assert!(loader.get("good").is_some());
        assert!(loader.get("bad").is_none());
        assert_eq!(loader.list().len(), 1);
    }

    #[test]
    fn test_resolve_gpt_local_defaults_and_override() {
        let (_dir, loader) = loader_with(&[(
            "gpt.yaml",
            "name: gpt-local\nbackend: llama-cpp\nparameters:\n  model: gpt.gguf\n",
        )]);

        let cfg = loader.resolve("gpt-local", &RequestOverrides::default()).unwrap();
        assert_eq!(cfg.parameters.top_p, 0.7);
        assert_eq!(cfg.parameters.top_k, 80);
        assert_eq!(cfg.parameters.max_tokens, 512);
        assert_eq!(cfg.parameters.temperature, 0.9);

        let cfg = loader
            .resolve("gpt-local", &RequestOverrides::default().with_temperature(0.2))
            .unwrap();
        assert_eq!(cfg.parameters.top_p, 0.7);
        assert_eq!(cfg.parameters.top_k, 80);
        assert_eq!(cfg.parameters.max_tokens, 512);
        assert_eq!(cfg.parameters.temperature, 0.2);

        assert_eq!(loader.get("gpt-local").unwrap().parameters.temperature, 0.9);
    }

    #[test]
    fn test_resolve_falls_back_to_model_file() {
        let (dir, loader) = loader_with(&[]);
        fs::write(dir.path().join("raw.gguf"), b"weights").unwrap();

        let cfg = loader.resolve("raw.gguf", &RequestOverrides::default()).unwrap();
        assert_eq!(cfg.model_file(), "raw.gguf");
        assert_eq!(cfg.backend, DEFAULT_BACKEND);
        assert_eq!(cfg.runtime.threads, Some(4));

        let cfg = loader
            .resolve("raw.gguf", &RequestOverrides::default().with_backend("whisper"))
            .unwrap();
        assert_eq!(cfg.backend, "whisper");
    }

    #[test]
    fn test_resolve_unknown_is_config_not_found() {
        let (_dir, loader) = loader_with(&[]);
        let err = loader
            .resolve("does-not-exist", &RequestOverrides::default())
            .unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(name) if name == "does-not-exist"));

        let err = loader
            .resolve("../etc/passwd", &RequestOverrides::default())
            .unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[test]
    fn test_duplicate_name_later_file_wins() {
        let (_dir, loader) = loader_with(&[
            ("a.yaml", "name: shared\nparameters: { model: first.bin }\n"),
            ("b.yaml", "- name: shared\n  parameters: { model: second.bin }\n- name: other\n  parameters: { model: o.bin }\n"),
        ]);
        assert_eq!(loader.list().len(), 2);
        assert_eq!(loader.get("shared").unwrap().model_file(), "second.bin");
    }

    #[test]
    fn test_overrides_cannot_leave_models_directory() {
        let (dir, loader) = loader_with(&[(
            "gpt.yaml",
            "name: gpt-local\nbackend: llama-cpp\nparameters:\n  model: gpt.gguf\n",
        )]);
        fs::write(dir.path().join("raw.gguf"), b"weights").unwrap();

        for model in ["../../secret", "/etc/shadow", "sub/../../x"] {
            let err = loader
                .resolve("gpt-local", &RequestOverrides::default().with_model(model))
                .unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)), "{} was accepted", model);
        }
        let cfg = loader
            .resolve("gpt-local", &RequestOverrides::default().with_model("sub/other.gguf"))
            .unwrap();
        assert_eq!(cfg.model_file(), "sub/other.gguf");

        for backend in ["../../../../bin/sh", "/bin/sh", "grpc/llama", ".."] {
            let err = loader
                .resolve("raw.gguf", &RequestOverrides::default().with_backend(backend))
                .unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)), "{} was accepted", backend);
        }
    }

    #[test]
    fn test_reload_replaces_records() {
        let (dir, loader) = loader_with(&[("a.yaml", "name: a\nparameters: { model: a.bin }\n")]);
        loader
            .register(BackendConfig::for_model_file("in-memory.bin"))
            .unwrap();
        assert_eq!(loader.list().len(), 2);

        fs::remove_file(dir.path().join("a.yaml")).unwrap();
        fs::write(dir.path().join("b.yaml"), "name: b\nparameters: { model: b.bin }\n").unwrap();

        assert_eq!(loader.reload().unwrap(), 1);
        assert!(loader.get("a").is_none());
        assert!(loader.get("in-memory.bin").is_none());
        assert!(loader.get("b").is_some());
    }
}
