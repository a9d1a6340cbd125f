//! localgate core
//!
//! A local inference gateway dispatches completions, embeddings,
//! transcription, speech synthesis and image generation to model runtimes
//! that each live in their own worker process, reached over gRPC.
//!
//! The pieces, leaf first:
//!
//! - [`config`]: gateway settings and per-model [`BackendConfig`] records,
//!   resolved by the [`ConfigLoader`]
//! - [`model_worker`]: the [`Backend`] trait, worker launching, and the
//!   managed [`WorkerHandle`] that serializes access to one worker
//! - [`model_registry`]: the [`Registry`] pool keyed by [`ModelKey`], with
//!   single-flight spawning and teardown
//! - [`monitor`]: resource sampling, forced shutdown and the optional
//!   [`WatchDog`] eviction loop
//! - [`dispatch`]: the [`Dispatcher`] facade request handlers call
//!
//! # Example
//!
//! ```no_run
//! use localgate_core::{Dispatcher, GatewayConfig, InvokeRequest};
//!
//! # async fn run() -> localgate_core::Result<()> {
//! let dispatcher = Dispatcher::from_gateway_config(&GatewayConfig::from_env())?;
//! let output = dispatcher
//!     .invoke(InvokeRequest::predict("gpt-local", "Hello"))
//!     .await?;
//! println!("{:?}", output);
//! dispatcher.registry().stop_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod model_registry;
pub mod model_worker;
pub mod monitor;
pub mod process;
pub mod proto;

pub use config::{BackendConfig, ConfigLoader, GatewayConfig, RequestOverrides};
pub use dispatch::{Dispatcher, InvokeRequest, Operation, Output, Payload};
pub use error::{Error, Result};
pub use model_registry::{ModelKey, Registry, RegistryConfig, RegistryMetrics, WorkerInfo};
pub use model_worker::{
    Backend, BackendFactory, BackendLauncher, Capabilities, SpawnedWorker, TokenStream,
    WorkerHandle, WorkerState,
};
pub use monitor::{BackendMonitor, BackendUsage, WatchDog};
