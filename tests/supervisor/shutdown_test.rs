//! Supervisor shutdown.

use std::sync::Arc;
use std::time::Duration;

use conduit::config::{ConnectionConfigMap, LogicalConnection, PluginSettings};
use conduit::supervisor::{Supervisor, SupervisorConfig, SupervisorError};
use conduit::testing::{FakeBehavior, FakeSpawner, RecordingRefresher};

fn supervisor(spawner: Arc<FakeSpawner>) -> Arc<Supervisor> {
    let plugins = ["aws", "gcp", "legacy"]
        .into_iter()
        .map(|k| (k.to_string(), PluginSettings::new(format!("conduit-plugin-{}", k))))
        .collect();
    Arc::new(Supervisor::new(
        SupervisorConfig::default(),
        plugins,
        spawner,
        Arc::new(RecordingRefresher::new()),
    ))
}

fn connections(entries: &[(&str, &str)]) -> ConnectionConfigMap {
    entries
        .iter()
        .map(|(name, plugin)| (name.to_string(), LogicalConnection::new(*name, *plugin, "cfg")))
        .collect()
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_shutdown_kills_every_process_once() {
    let spawner = Arc::new(FakeSpawner::default().with_behavior("legacy", FakeBehavior::legacy()));
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[
        ("a", "aws"),
        ("b", "aws"),
        ("g", "gcp"),
        ("l1", "legacy"),
        ("l2", "legacy"),
    ]))
    .await
    .unwrap();
    sup.get(&names(&["a", "b", "g", "l1", "l2"])).await.unwrap();
    assert_eq!(spawner.all_spawned().len(), 4);

    assert_eq!(sup.shutdown().unwrap(), 4);
    for record in spawner.all_spawned() {
        assert_eq!(record.process.kill_count(), 1, "{} killed once", record.kind);
        assert!(!record.process.is_running());
    }

    // A second shutdown has nothing left to kill.
    assert_eq!(sup.shutdown().unwrap(), 0);
    for record in spawner.all_spawned() {
        assert_eq!(record.process.kill_count(), 1);
    }

    let snapshot = sup.snapshot().unwrap();
    assert!(snapshot.workers.is_empty());
    assert!(snapshot.by_connection.is_empty());
    assert!(snapshot.multiplexing.is_empty());
}

#[tokio::test]
async fn test_calls_after_shutdown_are_rejected() {
    let spawner = Arc::new(FakeSpawner::default());
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws")]))
        .await
        .unwrap();
    sup.shutdown().unwrap();

    assert!(matches!(
        sup.get(&names(&["a"])).await,
        Err(SupervisorError::ShuttingDown)
    ));
    assert!(matches!(
        sup.set_connection_config_map(connections(&[("b", "aws")])).await,
        Err(SupervisorError::ShuttingDown)
    ));
    assert_eq!(spawner.spawn_attempts(), 0);
}

#[tokio::test]
async fn test_launch_finishing_after_shutdown_is_discarded() {
    let spawner = Arc::new(FakeSpawner::new(FakeBehavior {
        spawn_delay: Duration::from_millis(100),
        ..FakeBehavior::multiplexing()
    }));
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws")]))
        .await
        .unwrap();

    let starter = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.get(&names(&["a"])).await })
    };
    spawner.wait_for_attempt().await;

    // The placeholder has no process yet.
    assert_eq!(sup.shutdown().unwrap(), 0);

    let result = starter.await.unwrap();
    assert!(matches!(result, Err(SupervisorError::ShuttingDown)));

    let record = &spawner.spawned("aws")[0];
    assert_eq!(record.process.kill_count(), 1);
    assert_eq!(spawner.live_count("aws"), 0);
    assert!(sup.snapshot().unwrap().workers.is_empty());
}

#[tokio::test]
async fn test_waiters_are_released_by_shutdown() {
    let spawner = Arc::new(FakeSpawner::new(FakeBehavior {
        hang: true,
        ..FakeBehavior::multiplexing()
    }));
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws"), ("b", "aws")]))
        .await
        .unwrap();

    let _starter = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.get(&names(&["a"])).await })
    };
    spawner.wait_for_attempt().await;

    let waiter = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.get(&names(&["b"])).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    sup.shutdown().unwrap();

    // Released well before the 5s startup timeout.
    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter released")
        .unwrap();
    match result {
        Err(SupervisorError::ShuttingDown) => {}
        Ok(response) => assert!(response.failure_map.contains_key("aws")),
        Err(other) => panic!("unexpected error: {}", other),
    }
}
