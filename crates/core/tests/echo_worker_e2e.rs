//! End-to-end test through real worker processes
//!
//! Spawns the `echo-worker` binary via the gRPC launcher, exactly as a
//! bundled backend would be.

#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use localgate_core::config::WorkerSettings;
use localgate_core::{Dispatcher, Error, GatewayConfig, InvokeRequest, Output};

const ECHO_WORKER: &str = env!("CARGO_BIN_EXE_echo-worker");

fn gateway(root: &Path) -> GatewayConfig {
    let models = root.join("models");
    std::fs::create_dir_all(&models).unwrap();
    std::fs::write(
        models.join("echo.yaml"),
        "name: echo-model\nbackend: echo\nparameters:\n  model: echo.bin\n",
    )
    .unwrap();

    let mut config = GatewayConfig {
        models_path: models,
        audio_dir: root.join("audio"),
        image_dir: root.join("images"),
        worker: WorkerSettings {
            attempts: 50,
            attempts_sleep_ms: 100,
            grace_period_ms: 500,
            ..Default::default()
        },
        ..Default::default()
    };
    config
        .external_backends
        .insert("echo".to_string(), ECHO_WORKER.into());
    config
}

fn process_exists(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test]
async fn test_echo_worker_round_trip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let dispatcher = Dispatcher::from_gateway_config(&gateway(tmp.path())).unwrap();

    let reply = dispatcher
        .invoke(InvokeRequest::predict("echo-model", "hello world"))
        .await
        .unwrap();
    assert_eq!(reply.into_text().unwrap(), "hello world");

    let stream = dispatcher
        .invoke(InvokeRequest::predict_stream("echo-model", "one two three"))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert_eq!(stream.into_text().await.unwrap(), "one two three");

    match dispatcher
        .invoke(InvokeRequest::embed("echo-model", "vector"))
        .await
        .unwrap()
    {
        Output::Embedding(vector) => assert_eq!(vector.len(), 8),
        other => panic!("expected an embedding, got {:?}", other),
    }

    let audio = dispatcher
        .invoke(InvokeRequest::synthesize("echo-model", "speak"))
        .await
        .unwrap()
        .into_file()
        .unwrap();
    assert!(audio.starts_with(tmp.path().join("audio")));
    assert!(std::fs::read_to_string(&audio).unwrap().ends_with("speak"));

    let usage = dispatcher
        .monitor()
        .check_and_sample("echo-model")
        .await
        .unwrap();
    let pid = usage.pid.unwrap();
    assert!(process_exists(pid));
    assert!(usage.memory.map_or(true, |m| m.total > 0));

    dispatcher.registry().stop_all().await.unwrap();
    assert!(dispatcher.registry().is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
    let tmp = tempfile::TempDir::new().unwrap();
    let dispatcher = Dispatcher::from_gateway_config(&gateway(tmp.path())).unwrap();

    dispatcher
        .invoke(InvokeRequest::predict("echo-model", "before"))
        .await
        .unwrap();
    let first = dispatcher.registry().handles()[0].clone();
    let pid = first.pid().unwrap();

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = dispatcher
        .invoke(InvokeRequest::predict("echo-model", "during"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)));
    assert!(dispatcher.registry().is_empty());

    let reply = dispatcher
        .invoke(InvokeRequest::predict("echo-model", "after"))
        .await
        .unwrap();
    assert_eq!(reply.into_text().unwrap(), "after");
    let second = dispatcher.registry().handles()[0].clone();
    assert_ne!(second.pid(), Some(pid));

    dispatcher.registry().stop_all().await.unwrap();
}

#[tokio::test]
async fn test_missing_worker_executable() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut config = gateway(tmp.path());
    config.external_backends.insert(
        "echo".to_string(),
        tmp.path().join("no-such-worker"),
    );
    let dispatcher = Dispatcher::from_gateway_config(&config).unwrap();

    let err = dispatcher
        .invoke(InvokeRequest::predict("echo-model", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BackendSpawnFailed { ref backend, .. } if backend == "echo"));
    assert!(dispatcher.registry().is_empty());
}
