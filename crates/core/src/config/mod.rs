//! Configuration for the gateway core
//!
//! Two layers: [`GatewayConfig`] holds process-wide settings (TOML/env),
//! [`BackendConfig`] holds one record per model (YAML), resolved through
//! the [`ConfigLoader`].

pub mod backend;
pub mod gateway;
pub mod loader;

pub use backend::{
    is_contained_path, is_valid_backend_tag, BackendConfig, ConfigDefaults, DiffusersOptions, Extensions, GrpcOptions, PredictionOptions,
    RequestOverrides, RuntimeOptions, TtsOptions,
};
pub use gateway::{GatewayConfig, WatchdogSettings, WorkerSettings};
pub use loader::{ConfigLoader, DEFAULT_BACKEND};
