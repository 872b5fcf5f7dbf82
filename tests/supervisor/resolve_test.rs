//! Resolving connections: sharing, isolation and startup waits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit::config::{ConnectionConfigMap, LogicalConnection, PluginSettings};
use conduit::supervisor::{Supervisor, SupervisorConfig, WorkerState};
use conduit::testing::{FakeBehavior, FakeSpawner, RecordingRefresher};

fn supervisor(spawner: Arc<FakeSpawner>, startup_timeout: Duration) -> Arc<Supervisor> {
    let plugins = ["aws", "gcp", "legacy"]
        .into_iter()
        .map(|k| (k.to_string(), PluginSettings::new(format!("conduit-plugin-{}", k))))
        .collect();
    let config = SupervisorConfig {
        startup_timeout,
        ..Default::default()
    };
    Arc::new(Supervisor::new(
        config,
        plugins,
        spawner,
        Arc::new(RecordingRefresher::new()),
    ))
}

fn connections(entries: &[(&str, &str)]) -> ConnectionConfigMap {
    entries
        .iter()
        .map(|(name, plugin)| {
            (
                name.to_string(),
                LogicalConnection::new(*name, *plugin, format!("{{\"name\":\"{}\"}}", name)),
            )
        })
        .collect()
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn slow(behavior: FakeBehavior) -> FakeBehavior {
    FakeBehavior {
        spawn_delay: Duration::from_millis(50),
        ..behavior
    }
}

#[tokio::test]
async fn test_concurrent_gets_spawn_one_multiplexing_worker() {
    let spawner = Arc::new(FakeSpawner::new(slow(FakeBehavior::multiplexing())));
    let sup = supervisor(spawner.clone(), Duration::from_secs(2));
    sup.set_connection_config_map(connections(&[("a", "aws"), ("b", "aws"), ("c", "aws")]))
        .await
        .unwrap();

    let calls = ["a", "b", "c", "a", "b"].map(|name| {
        let sup = sup.clone();
        tokio::spawn(async move { sup.get(&names(&[name])).await })
    });
    let responses = futures::future::join_all(calls).await;

    let pids: HashSet<u32> = responses
        .into_iter()
        .map(|joined| {
            let response = joined.unwrap().unwrap();
            assert!(response.failure_map.is_empty());
            response.reattach_map.values().next().unwrap().pid
        })
        .collect();
    assert_eq!(pids.len(), 1);
    assert_eq!(spawner.spawn_count("aws"), 1);

    // One config handoff carrying every connection of the kind.
    let worker = &spawner.spawned("aws")[0].worker;
    let calls = worker.calls();
    assert_eq!(calls.set_all.len(), 1);
    let mut sent: Vec<_> = calls.set_all[0].configs.iter().map(|c| c.name.clone()).collect();
    sent.sort();
    assert_eq!(sent, names(&["a", "b", "c"]));
}

#[tokio::test]
async fn test_single_get_returns_every_connection_of_shared_worker() {
    let spawner = Arc::new(FakeSpawner::default());
    let sup = supervisor(spawner.clone(), Duration::from_secs(1));
    sup.set_connection_config_map(connections(&[("a", "aws"), ("b", "aws"), ("g", "gcp")]))
        .await
        .unwrap();

    let response = sup.get(&names(&["a", "g", "b"])).await.unwrap();
    assert_eq!(response.reattach_map.len(), 3);
    assert_eq!(response.reattach_map["a"].pid, response.reattach_map["b"].pid);
    assert_ne!(response.reattach_map["a"].pid, response.reattach_map["g"].pid);
    assert_eq!(response.reattach_map["g"].plugin, "gcp");
    assert!(response.reattach_map["a"].serves("b"));
    assert_eq!(spawner.spawn_attempts(), 2);
}

#[tokio::test]
async fn test_legacy_connections_get_their_own_process() {
    let spawner = Arc::new(FakeSpawner::new(slow(FakeBehavior::legacy())));
    let sup = supervisor(spawner.clone(), Duration::from_secs(2));
    sup.set_connection_config_map(connections(&[("l1", "legacy"), ("l2", "legacy")]))
        .await
        .unwrap();

    let first = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.get(&names(&["l1"])).await })
    };
    let second = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.get(&names(&["l2"])).await })
    };
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    let l1 = &first.reattach_map["l1"];
    let l2 = &second.reattach_map["l2"];
    assert_ne!(l1.pid, l2.pid);
    assert_eq!(l1.connections, names(&["l1"]));
    assert_eq!(l2.connections, names(&["l2"]));
    assert_eq!(spawner.spawn_count("legacy"), 2);

    // Each legacy worker received exactly its own config.
    for record in spawner.spawned("legacy") {
        let calls = record.worker.calls();
        assert!(calls.set_all.is_empty());
        assert_eq!(calls.set_single.len(), 1);
    }

    // Asking again reuses the existing processes.
    let again = sup.get(&names(&["l1", "l2"])).await.unwrap();
    assert_eq!(again.reattach_map["l1"].pid, l1.pid);
    assert_eq!(again.reattach_map["l2"].pid, l2.pid);
    assert_eq!(spawner.spawn_count("legacy"), 2);
}

#[tokio::test]
async fn test_waiter_gives_up_after_startup_timeout() {
    let hanging = FakeBehavior {
        hang: true,
        ..FakeBehavior::multiplexing()
    };
    let spawner = Arc::new(FakeSpawner::new(hanging));
    let sup = supervisor(spawner.clone(), Duration::from_millis(150));
    sup.set_connection_config_map(connections(&[("a", "aws"), ("b", "aws")]))
        .await
        .unwrap();

    let starter = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.get(&names(&["a"])).await })
    };
    spawner.wait_for_attempt().await;

    let started = Instant::now();
    let response = sup.get(&names(&["b"])).await.unwrap();
    let waited = started.elapsed();

    assert!(response.reattach_map.is_empty());
    assert!(response.failure_map["aws"].contains("timed out"));
    assert!(waited >= Duration::from_millis(150));
    assert!(waited < Duration::from_secs(2));
    assert_eq!(spawner.spawn_attempts(), 1);

    // The abandoned launch leaves no placeholder behind.
    starter.abort();
    let _ = starter.await;
    let snapshot = sup.snapshot().unwrap();
    assert!(snapshot.starting.is_empty());
    assert!(snapshot.workers.is_empty());
}

#[tokio::test]
async fn test_waiters_fail_fast_when_launch_fails() {
    let failing = FakeBehavior {
        spawn_delay: Duration::from_millis(50),
        spawn_error: Some("exec format error".to_string()),
        ..FakeBehavior::multiplexing()
    };
    let spawner = Arc::new(FakeSpawner::new(failing));
    let sup = supervisor(spawner.clone(), Duration::from_secs(5));
    sup.set_connection_config_map(connections(&[("a", "aws"), ("b", "aws")]))
        .await
        .unwrap();

    let starter = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.get(&names(&["a"])).await })
    };
    spawner.wait_for_attempt().await;

    let started = Instant::now();
    let waiter = sup.get(&names(&["b"])).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(waiter.failure_map.contains_key("aws"));

    let starter = starter.await.unwrap().unwrap();
    assert!(starter.failure_map["aws"].contains("exec format error"));
}

#[tokio::test]
async fn test_refused_connection_reported_as_failure() {
    let mut behavior = FakeBehavior::multiplexing();
    behavior.refuse.insert("bad".to_string());
    let spawner = Arc::new(FakeSpawner::new(behavior));
    let sup = supervisor(spawner.clone(), Duration::from_secs(1));
    sup.set_connection_config_map(connections(&[("good", "aws"), ("bad", "aws")]))
        .await
        .unwrap();

    let response = sup.get(&names(&["bad"])).await.unwrap();
    assert!(response.reattach_map.is_empty());
    assert!(response.failure_map.contains_key("aws"));

    // The refusal is per connection, the kind still serves the others.
    let response = sup.get(&names(&["good"])).await.unwrap();
    assert!(response.reattach_map.contains_key("good"));
    assert!(!response.reattach_map["good"].serves("bad"));
}

#[tokio::test]
async fn test_snapshot_reports_ready_worker_and_budgets() {
    let spawner = Arc::new(FakeSpawner::default());
    let plugins = [("aws".to_string(), PluginSettings::new("conduit-plugin-aws"))]
        .into_iter()
        .collect();
    let config = SupervisorConfig {
        max_cache_size_mb: 300,
        ..Default::default()
    };
    let sup = Supervisor::new(config, plugins, spawner, Arc::new(RecordingRefresher::new()));
    sup.set_connection_config_map(connections(&[("a", "aws"), ("b", "aws")]))
        .await
        .unwrap();
    sup.get(&names(&["a"])).await.unwrap();

    let snapshot = sup.snapshot().unwrap();
    let workers = snapshot.workers_for("aws");
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].state, WorkerState::Ready);
    assert!(workers[0].has_process);
    assert_eq!(snapshot.plugin_connections["aws"], names(&["a", "b"]));
    assert_eq!(snapshot.cache_budgets["aws"], 300);
    assert_eq!(snapshot.by_connection.len(), 2);
}
