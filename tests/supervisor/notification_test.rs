//! Schema refresh notifications from plugin message streams.

use std::sync::Arc;
use std::time::Duration;

use conduit::config::{ConnectionConfigMap, LogicalConnection, PluginSettings};
use conduit::supervisor::{Supervisor, SupervisorConfig};
use conduit::testing::{FakeBehavior, FakeMessage, FakeSpawner, RecordingRefresher};

const WAIT: Duration = Duration::from_secs(2);

fn supervisor(spawner: Arc<FakeSpawner>, refresher: Arc<RecordingRefresher>) -> Supervisor {
    let plugins = ["aws", "legacy"]
        .into_iter()
        .map(|k| (k.to_string(), PluginSettings::new(format!("conduit-plugin-{}", k))))
        .collect();
    Supervisor::new(SupervisorConfig::default(), plugins, spawner, refresher)
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
async fn test_schema_update_triggers_refresh() {
    let behavior = FakeBehavior {
        messages: vec![
            FakeMessage::SchemaUpdated("a".to_string()),
            FakeMessage::Unknown("b".to_string()),
            FakeMessage::SchemaUpdated("b".to_string()),
        ],
        ..FakeBehavior::multiplexing()
    };
    let spawner = Arc::new(FakeSpawner::new(behavior));
    let refresher = Arc::new(RecordingRefresher::new());
    let sup = supervisor(spawner.clone(), refresher.clone());
    sup.set_connection_config_map(connections(&[("a", "aws"), ("b", "aws")]))
        .await
        .unwrap();
    sup.get(&names(&["a"])).await.unwrap();

    let mut refreshed = refresher.wait_for(2, WAIT).await;
    refreshed.sort();
    assert_eq!(refreshed, names(&["a", "b"]));

    // One stream per served connection.
    let mut streams = spawner.spawned("aws")[0].worker.calls().streams;
    streams.sort();
    assert_eq!(streams, names(&["a", "b"]));
}

#[tokio::test]
async fn test_malformed_messages_do_not_stop_the_stream() {
    let behavior = FakeBehavior {
        messages: vec![
            FakeMessage::Malformed,
            FakeMessage::Malformed,
            FakeMessage::SchemaUpdated("a".to_string()),
        ],
        ..FakeBehavior::multiplexing()
    };
    let spawner = Arc::new(FakeSpawner::new(behavior));
    let refresher = Arc::new(RecordingRefresher::new());
    let sup = supervisor(spawner, refresher.clone());
    sup.set_connection_config_map(connections(&[("a", "aws")]))
        .await
        .unwrap();
    sup.get(&names(&["a"])).await.unwrap();

    assert_eq!(refresher.wait_for(1, WAIT).await, names(&["a"]));
}

#[tokio::test]
async fn test_long_error_burst_keeps_stream_alive() {
    let mut messages = vec![FakeMessage::Malformed; 20];
    messages.push(FakeMessage::SchemaUpdated("a".to_string()));
    let behavior = FakeBehavior {
        messages,
        ..FakeBehavior::multiplexing()
    };
    let spawner = Arc::new(FakeSpawner::new(behavior));
    let refresher = Arc::new(RecordingRefresher::new());
    let sup = supervisor(spawner, refresher.clone());
    sup.set_connection_config_map(connections(&[("a", "aws")]))
        .await
        .unwrap();
    sup.get(&names(&["a"])).await.unwrap();

    assert_eq!(
        refresher.wait_for(1, Duration::from_secs(5)).await,
        names(&["a"])
    );
}

#[tokio::test]
async fn test_connection_added_live_gets_a_stream() {
    let behavior = FakeBehavior {
        messages: vec![FakeMessage::SchemaUpdated("c".to_string())],
        ..FakeBehavior::multiplexing()
    };
    let spawner = Arc::new(FakeSpawner::new(behavior));
    let refresher = Arc::new(RecordingRefresher::new());
    let sup = supervisor(spawner.clone(), refresher.clone());
    sup.set_connection_config_map(connections(&[("a", "aws")]))
        .await
        .unwrap();
    sup.get(&names(&["a"])).await.unwrap();

    sup.set_connection_config_map(connections(&[("a", "aws"), ("c", "aws")]))
        .await
        .unwrap();

    assert_eq!(refresher.wait_for(1, WAIT).await, names(&["c"]));
    let streams = spawner.spawned("aws")[0].worker.calls().streams;
    assert!(streams.contains(&"c".to_string()));
}

#[tokio::test]
async fn test_stream_not_implemented_is_tolerated() {
    let behavior = FakeBehavior {
        stream_not_implemented: true,
        ..FakeBehavior::multiplexing()
    };
    let spawner = Arc::new(FakeSpawner::new(behavior));
    let refresher = Arc::new(RecordingRefresher::new());
    let sup = supervisor(spawner, refresher.clone());
    sup.set_connection_config_map(connections(&[("a", "aws")]))
        .await
        .unwrap();

    let response = sup.get(&names(&["a"])).await.unwrap();
    assert!(response.reattach_map.contains_key("a"));
    assert!(refresher.refreshed().is_empty());
}

#[tokio::test]
async fn test_legacy_worker_opens_no_stream() {
    let spawner = Arc::new(FakeSpawner::new(FakeBehavior::legacy()));
    let refresher = Arc::new(RecordingRefresher::new());
    let sup = supervisor(spawner.clone(), refresher);
    sup.set_connection_config_map(connections(&[("l", "legacy")]))
        .await
        .unwrap();
    sup.get(&names(&["l"])).await.unwrap();

    assert!(spawner.spawned("legacy")[0].worker.calls().streams.is_empty());
}
