//! Pushing configuration changes to running plugins.

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

/// `(name, plugin, config)` triples.
fn connections(entries: &[(&str, &str, &str)]) -> ConnectionConfigMap {
    entries
        .iter()
        .map(|(name, plugin, config)| {
            (name.to_string(), LogicalConnection::new(*name, *plugin, *config))
        })
        .collect()
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn sorted_names(conns: &[LogicalConnection]) -> Vec<String> {
    let mut names: Vec<_> = conns.iter().map(|c| c.name.clone()).collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_changes_are_sent_as_one_batch() {
    let spawner = Arc::new(FakeSpawner::default());
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws", "1"), ("b", "aws", "1")]))
        .await
        .unwrap();
    let pid = sup.get(&names(&["a"])).await.unwrap().reattach_map["a"].pid;

    sup.set_connection_config_map(connections(&[
        ("b", "aws", "2"),
        ("c", "aws", "1"),
        ("d", "aws", "1"),
    ]))
    .await
    .unwrap();

    let worker = spawner.spawned("aws")[0].worker.clone();
    let updates = worker.calls().updates;
    assert_eq!(updates.len(), 1);
    assert_eq!(sorted_names(&updates[0].added), names(&["c", "d"]));
    assert_eq!(sorted_names(&updates[0].changed), names(&["b"]));
    assert_eq!(sorted_names(&updates[0].deleted), names(&["a"]));

    // Added connections are served by the running process.
    let response = sup.get(&names(&["c", "d"])).await.unwrap();
    assert_eq!(response.reattach_map["c"].pid, pid);
    assert_eq!(response.reattach_map["d"].pid, pid);
    assert!(!response.reattach_map["c"].serves("a"));
    assert_eq!(spawner.spawn_count("aws"), 1);
}

#[tokio::test]
async fn test_reapplying_a_diff_sends_nothing() {
    let spawner = Arc::new(FakeSpawner::default());
    let sup = supervisor(spawner.clone());
    let initial = connections(&[("a", "aws", "1"), ("b", "aws", "1")]);
    sup.set_connection_config_map(initial.clone()).await.unwrap();
    sup.get(&names(&["a"])).await.unwrap();

    // Unchanged config is a no-op.
    sup.set_connection_config_map(initial).await.unwrap();
    let worker = spawner.spawned("aws")[0].worker.clone();
    assert!(worker.calls().updates.is_empty());

    // A real change is sent once, and only once.
    let changed = connections(&[("a", "aws", "1"), ("b", "aws", "2"), ("c", "aws", "1")]);
    sup.set_connection_config_map(changed.clone()).await.unwrap();
    assert_eq!(worker.calls().updates.len(), 1);

    sup.set_connection_config_map(changed.clone()).await.unwrap();
    sup.set_connection_config_map(changed).await.unwrap();
    assert_eq!(worker.calls().updates.len(), 1);
    assert_eq!(spawner.spawn_count("aws"), 1);
}

#[tokio::test]
async fn test_only_changed_kinds_are_updated() {
    let spawner = Arc::new(FakeSpawner::default());
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws", "1"), ("g", "gcp", "1")]))
        .await
        .unwrap();
    sup.get(&names(&["a", "g"])).await.unwrap();

    sup.set_connection_config_map(connections(&[("a", "aws", "2"), ("g", "gcp", "1")]))
        .await
        .unwrap();

    assert_eq!(spawner.spawned("aws")[0].worker.calls().updates.len(), 1);
    assert!(spawner.spawned("gcp")[0].worker.calls().updates.is_empty());
}

#[tokio::test]
async fn test_changed_legacy_connection_restarts_its_process() {
    let spawner = Arc::new(FakeSpawner::new(FakeBehavior::legacy()));
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("l1", "legacy", "1"), ("l2", "legacy", "1")]))
        .await
        .unwrap();
    let before = sup.get(&names(&["l1", "l2"])).await.unwrap();

    sup.set_connection_config_map(connections(&[("l1", "legacy", "2"), ("l2", "legacy", "1")]))
        .await
        .unwrap();

    let records = spawner.spawned("legacy");
    let l1 = records
        .iter()
        .find(|r| r.process.pid_value() == before.reattach_map["l1"].pid)
        .unwrap();
    let l2 = records
        .iter()
        .find(|r| r.process.pid_value() == before.reattach_map["l2"].pid)
        .unwrap();
    assert_eq!(l1.process.kill_count(), 1);
    assert_eq!(l2.process.kill_count(), 0);

    let after = sup.get(&names(&["l1", "l2"])).await.unwrap();
    assert_ne!(after.reattach_map["l1"].pid, before.reattach_map["l1"].pid);
    assert_eq!(after.reattach_map["l2"].pid, before.reattach_map["l2"].pid);

    let restarted = spawner.spawned("legacy").pop().unwrap();
    let sent = restarted.worker.calls().set_single;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].config, "2");
}

#[tokio::test]
async fn test_worker_without_live_update_is_restarted() {
    let spawner = Arc::new(FakeSpawner::new(FakeBehavior::multiplexing_without_live_update()));
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws", "1")]))
        .await
        .unwrap();
    let old = sup.get(&names(&["a"])).await.unwrap().reattach_map["a"].pid;

    sup.set_connection_config_map(connections(&[("a", "aws", "1"), ("b", "aws", "1")]))
        .await
        .unwrap();
    assert_eq!(spawner.spawned("aws")[0].process.kill_count(), 1);
    assert!(spawner.spawned("aws")[0].worker.calls().updates.is_empty());

    let response = sup.get(&names(&["b"])).await.unwrap();
    assert_ne!(response.reattach_map["b"].pid, old);
    assert!(response.reattach_map["b"].serves("a"));
    assert_eq!(spawner.spawn_count("aws"), 2);
}

#[tokio::test]
async fn test_partial_failure_names_failed_kinds() {
    let spawner = Arc::new(FakeSpawner::default().with_behavior(
        "gcp",
        FakeBehavior {
            fail_update: true,
            ..FakeBehavior::multiplexing()
        },
    ));
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws", "1"), ("g", "gcp", "1")]))
        .await
        .unwrap();
    sup.get(&names(&["a", "g"])).await.unwrap();

    let result = sup
        .set_connection_config_map(connections(&[("a", "aws", "2"), ("g", "gcp", "2")]))
        .await;
    match result {
        Err(SupervisorError::ConfigUpdateFailed(failures)) => {
            assert_eq!(failures.len(), 1);
            assert!(failures.contains_key("gcp"));
        }
        other => panic!("expected ConfigUpdateFailed, got {:?}", other),
    }

    // The healthy kind was still updated, the failed one restarts lazily.
    assert_eq!(spawner.spawned("aws")[0].worker.calls().updates.len(), 1);
    assert_eq!(spawner.spawned("gcp")[0].process.kill_count(), 1);

    spawner.set_behavior("gcp", FakeBehavior::multiplexing());
    let response = sup.get(&names(&["g"])).await.unwrap();
    assert!(response.failure_map.is_empty());
    assert_eq!(spawner.spawn_count("gcp"), 2);
    let resent = spawner.spawned("gcp")[1].worker.calls().set_all;
    assert_eq!(resent[0].configs[0].config, "2");
}

#[tokio::test]
async fn test_refused_update_is_not_served() {
    let mut behavior = FakeBehavior::multiplexing();
    behavior.refuse.insert("bad".to_string());
    let spawner = Arc::new(FakeSpawner::new(behavior));
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws", "1")]))
        .await
        .unwrap();
    sup.get(&names(&["a"])).await.unwrap();

    sup.set_connection_config_map(connections(&[("a", "aws", "1"), ("bad", "aws", "1")]))
        .await
        .unwrap();
    let snapshot = sup.snapshot().unwrap();
    assert!(!snapshot.by_connection.contains_key("bad"));

    let response = sup.get(&names(&["a"])).await.unwrap();
    assert!(!response.reattach_map["a"].serves("bad"));
}

#[tokio::test]
async fn test_config_changed_during_startup_is_applied() {
    let spawner = Arc::new(FakeSpawner::new(FakeBehavior {
        spawn_delay: Duration::from_millis(100),
        ..FakeBehavior::multiplexing()
    }));
    let sup = supervisor(spawner.clone());
    sup.set_connection_config_map(connections(&[("a", "aws", "1")]))
        .await
        .unwrap();

    let starter = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.get(&names(&["a"])).await })
    };
    spawner.wait_for_attempt().await;

    sup.set_connection_config_map(connections(&[("a", "aws", "2"), ("b", "aws", "1")]))
        .await
        .unwrap();

    let response = starter.await.unwrap().unwrap();
    assert!(response.reattach_map["a"].serves("b"));

    let calls = spawner.spawned("aws")[0].worker.calls();
    assert_eq!(calls.set_all.len(), 1);
    assert_eq!(calls.set_all[0].configs[0].config, "1");
    assert_eq!(calls.updates.len(), 1);
    assert_eq!(sorted_names(&calls.updates[0].added), names(&["b"]));
    assert_eq!(sorted_names(&calls.updates[0].changed), names(&["a"]));
    assert_eq!(spawner.spawn_count("aws"), 1);
}
