//! Model workers
//!
//! Each loaded model lives in its own worker, reached through the
//! [`Backend`] interface. A [`WorkerHandle`] wraps one worker with the
//! exclusive lock and state machine; launching is pluggable through
//! [`BackendLauncher`] constructors registered in a [`BackendFactory`].

pub mod backend;
pub mod client;
pub mod handle;
pub mod launcher;
pub mod status;
pub mod stream;

pub use backend::{Backend, BackendFactory, BackendLauncher, Capabilities, SpawnedWorker};
pub use client::GrpcBackend;
pub use handle::{HandleSettings, WorkerHandle};
pub use launcher::{GrpcLauncher, LauncherConfig};
pub use status::{StatusTracker, WorkerState};
pub use stream::TokenStream;
