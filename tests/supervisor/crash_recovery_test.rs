//! Restarting plugins that exited on their own.

use std::sync::Arc;
use std::time::Duration;

use conduit::config::{ConnectionConfigMap, LogicalConnection, PluginSettings};
use conduit::supervisor::{Supervisor, SupervisorConfig};
use conduit::testing::{FakeBehavior, FakeSpawner, RecordingRefresher};

fn supervisor(spawner: Arc<FakeSpawner>) -> Arc<Supervisor> {
    let plugins = ["aws", "legacy"]
        .into_iter()
        .map(|k| (k.to_string(), PluginSettings::new(format!("conduit-plugin-{}", k))))
        .collect();
    let config = SupervisorConfig {
        startup_timeout: Duration::from_secs(2),
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
        .map(|(name, plugin)| (name.to_string(), LogicalConnection::new(*name, *plugin, "cfg")))
        .collect()
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_dead_worker_is_replaced() {
    let spawner = Arc::new(FakeSpawner::default());
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws"), ("b", "aws")]))
        .await
        .unwrap();

    let before = sup.get(&names(&["a"])).await.unwrap().reattach_map["a"].clone();
    spawner.spawned("aws")[0].process.crash();

    let after = sup.get(&names(&["a", "b"])).await.unwrap();
    assert_ne!(after.reattach_map["a"].pid, before.pid);
    assert_eq!(after.reattach_map["a"].pid, after.reattach_map["b"].pid);
    assert_eq!(spawner.spawn_count("aws"), 2);

    // The replacement is the only worker of the kind left in the registry.
    let snapshot = sup.snapshot().unwrap();
    assert_eq!(snapshot.workers_for("aws").len(), 1);
}

#[tokio::test]
async fn test_concurrent_callers_relaunch_once() {
    let spawner = Arc::new(FakeSpawner::new(FakeBehavior {
        spawn_delay: Duration::from_millis(50),
        ..FakeBehavior::multiplexing()
    }));
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws"), ("b", "aws")]))
        .await
        .unwrap();

    let old_pid = sup.get(&names(&["a"])).await.unwrap().reattach_map["a"].pid;
    spawner.spawned("aws")[0].process.crash();

    let calls = ["a", "b", "a", "b"].map(|name| {
        let sup = sup.clone();
        tokio::spawn(async move { sup.get(&names(&[name])).await })
    });
    let pids: Vec<u32> = futures::future::join_all(calls)
        .await
        .into_iter()
        .map(|joined| {
            let response = joined.unwrap().unwrap();
            assert!(response.failure_map.is_empty(), "{:?}", response.failure_map);
            response.reattach_map.values().next().unwrap().pid
        })
        .collect();

    assert!(pids.iter().all(|pid| *pid == pids[0]));
    assert_ne!(pids[0], old_pid);
    assert_eq!(spawner.spawn_count("aws"), 2);
    assert_eq!(spawner.live_count("aws"), 1);
}

#[tokio::test]
async fn test_dead_legacy_worker_restarts_only_its_connection() {
    let spawner = Arc::new(FakeSpawner::new(FakeBehavior::legacy()));
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("l1", "legacy"), ("l2", "legacy")]))
        .await
        .unwrap();

    let first = sup.get(&names(&["l1", "l2"])).await.unwrap();
    let l1 = first.reattach_map["l1"].pid;
    let l2 = first.reattach_map["l2"].pid;

    let dead = spawner
        .spawned("legacy")
        .into_iter()
        .find(|r| r.process.pid_value() == l1)
        .unwrap();
    dead.process.crash();

    let second = sup.get(&names(&["l1", "l2"])).await.unwrap();
    assert_ne!(second.reattach_map["l1"].pid, l1);
    assert_eq!(second.reattach_map["l2"].pid, l2);
    assert_eq!(spawner.spawn_count("legacy"), 3);
}

#[tokio::test]
async fn test_failed_restart_can_be_retried() {
    let spawner = Arc::new(FakeSpawner::default());
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws")]))
        .await
        .unwrap();

    sup.get(&names(&["a"])).await.unwrap();
    spawner.spawned("aws")[0].process.crash();

    spawner.set_behavior(
        "aws",
        FakeBehavior {
            spawn_error: Some("binary removed".to_string()),
            ..FakeBehavior::multiplexing()
        },
    );
    let failed = sup.get(&names(&["a"])).await.unwrap();
    assert!(failed.failure_map["aws"].contains("binary removed"));
    assert!(sup.snapshot().unwrap().workers.is_empty());

    spawner.set_behavior("aws", FakeBehavior::multiplexing());
    let recovered = sup.get(&names(&["a"])).await.unwrap();
    assert!(recovered.reattach_map.contains_key("a"));
    assert_eq!(spawner.spawn_count("aws"), 2);
}
