//! Worker identity

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use prost::Message;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::BackendConfig;

/// Identity of a cacheable worker
///
/// Two requests with equal keys share one worker. The fingerprint covers the
/// options sent with `LoadModel`, so requests that differ only in sampling
/// parameters map to the same key while startup-affecting changes do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ModelKey {
    pub backend: String,
    pub model_file: String,
    pub fingerprint: String,
}

impl ModelKey {
    /// Key for a resolved config
    pub fn for_config(config: &BackendConfig, models_path: &Path) -> Self {
        let mut options = config.model_options(models_path);
        // seed is a sampling default, not a startup option
        options.seed = 0;
        // map encoding order is unspecified, hash the entries sorted instead
        let extra: BTreeMap<String, String> = std::mem::take(&mut options.options)
            .into_iter()
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(config.backend.as_bytes());
        hasher.update([0u8]);
        hasher.update(options.encode_to_vec());
        for (k, v) in &extra {
            hasher.update(k.as_bytes());
            hasher.update([0u8]);
            hasher.update(v.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();

        Self {
            backend: config.backend.clone(),
            model_file: config.model_file().to_string(),
            fingerprint: hex::encode(&digest[..8]),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.backend, self.model_file, self.fingerprint)
    }
}
