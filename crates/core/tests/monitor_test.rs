//! Resource monitor and watchdog against the fake backend

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fake_dispatcher, fake_registry, llm_config, FakeLauncher};
use localgate_core::config::WatchdogSettings;
use localgate_core::{Error, InvokeRequest, RegistryConfig, WatchDog, WorkerState};

#[tokio::test]
async fn test_sample_running_model() {
    let tmp = tempfile::TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let dispatcher = fake_dispatcher(tmp.path(), launcher);
    let monitor = dispatcher.monitor();

    assert!(matches!(
        monitor.check_and_sample("gpt-local").await,
        Err(Error::NotRunning(_))
    ));
    assert!(matches!(
        monitor.check_and_sample("missing").await,
        Err(Error::ConfigNotFound(_))
    ));
    // sampling never spawns
    assert!(dispatcher.registry().is_empty());

    dispatcher
        .invoke(InvokeRequest::predict("gpt-local", "Hello"))
        .await
        .unwrap();

    let usage = monitor.check_and_sample("gpt-local").await.unwrap();
    assert_eq!(usage.state, WorkerState::Ready);
    let memory = usage.memory.unwrap();
    assert_eq!(memory.total, 4096);
    assert_eq!(memory.breakdown.get("weights"), Some(&4096));
    assert!(usage.pid.is_none());

    assert_eq!(monitor.sample_all().await.len(), 1);
    dispatcher.registry().stop_all().await.unwrap();
}

#[tokio::test]
async fn test_sample_busy_model_does_not_queue() {
    let tmp = tempfile::TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new().with_op_delay(Duration::from_millis(500)));
    let dispatcher = Arc::new(fake_dispatcher(tmp.path(), launcher));

    let config = dispatcher
        .resolve("gpt-local", &Default::default())
        .unwrap();
    let handle = dispatcher.registry().get_or_create(&config).await.unwrap();
    let running = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .invoke(InvokeRequest::predict("gpt-local", "slow"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), WorkerState::Busy);

    let started = std::time::Instant::now();
    let usage = dispatcher.monitor().check_and_sample("gpt-local").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(usage.state, WorkerState::Busy);
    assert!(usage.memory.is_none());

    running.await.unwrap().unwrap();
    dispatcher.registry().stop_all().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_model_then_respawn() {
    let tmp = tempfile::TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let probe = Arc::clone(&launcher.probe);
    let dispatcher = fake_dispatcher(tmp.path(), launcher);
    let monitor = dispatcher.monitor();

    assert!(matches!(
        monitor.shutdown_model("gpt-local").await,
        Err(Error::NotRunning(_))
    ));

    dispatcher
        .invoke(InvokeRequest::predict("gpt-local", "one"))
        .await
        .unwrap();
    monitor.shutdown_model("gpt-local").await.unwrap();
    assert!(dispatcher.registry().is_empty());
    assert_eq!(probe.unloads(), 1);

    dispatcher
        .invoke(InvokeRequest::predict("gpt-local", "two"))
        .await
        .unwrap();
    assert_eq!(probe.loads(), 2);

    dispatcher.registry().stop_all().await.unwrap();
}

#[tokio::test]
async fn test_watchdog_evicts_idle_workers() {
    let launcher = Arc::new(FakeLauncher::new());
    let registry = fake_registry(launcher, RegistryConfig::new());
    let handle = registry.get_or_create(&llm_config("gpt.bin")).await.unwrap();

    let watchdog = WatchDog::new(Arc::clone(&registry), &WatchdogSettings::default())
        .with_idle_timeout(Some(Duration::from_secs(60)))
        .with_busy_timeout(None);
    assert!(watchdog.tick().await.is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    let watchdog = watchdog.with_idle_timeout(Some(Duration::from_millis(20)));
    let stopped = watchdog.tick().await;

    assert_eq!(stopped, vec![handle.key().clone()]);
    assert!(registry.is_empty());
    assert_eq!(handle.state(), WorkerState::Unloaded);
}

#[tokio::test]
async fn test_watchdog_evicts_stuck_workers() {
    let launcher = Arc::new(FakeLauncher::new().with_op_delay(Duration::from_secs(2)));
    let registry = fake_registry(
        launcher,
        RegistryConfig::new().with_drain_timeout(Duration::from_millis(100)),
    );
    let handle = registry.get_or_create(&llm_config("gpt.bin")).await.unwrap();

    let stuck = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            let options = llm_config("gpt.bin").predict_options("forever");
            handle.predict(options, None).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let watchdog = WatchDog::new(Arc::clone(&registry), &WatchdogSettings::default())
        .with_idle_timeout(None)
        .with_busy_timeout(Some(Duration::from_millis(20)));
    let stopped = watchdog.tick().await;

    assert_eq!(stopped, vec![handle.key().clone()]);
    assert!(registry.is_empty());
    assert_eq!(handle.state(), WorkerState::Error);

    stuck.abort();
}

#[tokio::test]
async fn test_watchdog_run_stops_on_shutdown() {
    let launcher = Arc::new(FakeLauncher::new());
    let registry = fake_registry(launcher, RegistryConfig::new());
    registry.get_or_create(&llm_config("gpt.bin")).await.unwrap();

    let settings = WatchdogSettings {
        enabled: true,
        ..Default::default()
    };
    let watchdog = WatchDog::from_settings(Arc::clone(&registry), &settings)
        .unwrap()
        .with_interval(Duration::from_millis(20))
        .with_idle_timeout(Some(Duration::from_millis(30)));

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(watchdog.run(async {
        let _ = rx.await;
    }));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(registry.is_empty());

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();

    assert!(WatchDog::from_settings(registry, &WatchdogSettings::default()).is_none());
}
