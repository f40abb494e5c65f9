//! Cluster coordination: CAS maps, lease failover across engine nodes

use meridian::*;
use std::sync::Arc;
use std::time::Duration;

fn clustered_engine(
    name: &str,
    store: Arc<InMemoryStore>,
    backend: Arc<dyn MapBackend>,
) -> Arc<Engine> {
    let mut config = Config::for_testing();
    config.server.id = Some(name.to_string());
    config.cluster.lease_ttl_secs = 1;
    let maps = Arc::new(GlobalMaps::new(backend));
    let bus = Arc::new(DbPollingEventBus::new(
        store.clone(),
        name.to_string(),
        Duration::from_millis(50),
    ));
    Engine::new(config, store, bus, maps, Arc::new(PassthroughScriptEngine))
}

#[cfg(test)]
mod cluster_tests {
    use super::*;

    #[tokio::test]
    async fn cas_contention_admits_one_writer_per_version() {
        let backend = Arc::new(InMemoryMapBackend::new());
        backend.set("global", "count", "0").await.unwrap();

        // two writers read the same version and race the same CAS
        let (a, b) = tokio::join!(
            async {
                let (value, version) = backend
                    .get_with_version("global", "count")
                    .await
                    .unwrap()
                    .unwrap();
                let next = value.parse::<i64>().unwrap() + 1;
                backend
                    .set_if_version("global", "count", &next.to_string(), version)
                    .await
                    .unwrap()
            },
            async {
                let (value, version) = backend
                    .get_with_version("global", "count")
                    .await
                    .unwrap()
                    .unwrap();
                let next = value.parse::<i64>().unwrap() + 1;
                backend
                    .set_if_version("global", "count", &next.to_string(), version)
                    .await
                    .unwrap()
            }
        );
        assert!(a ^ b, "exactly one writer wins; the loser must re-read");
    }

    #[tokio::test]
    async fn cas_retry_loop_serializes_increments() {
        let backend = Arc::new(InMemoryMapBackend::new());
        backend.set("global", "count", "0").await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let backend = backend.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    loop {
                        let (value, version) = backend
                            .get_with_version("global", "count")
                            .await
                            .unwrap()
                            .unwrap();
                        let next = value.parse::<i64>().unwrap() + 1;
                        if backend
                            .set_if_version("global", "count", &next.to_string(), version)
                            .await
                            .unwrap()
                        {
                            break;
                        }
                        // lost the race; re-read and try again
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let (value, _) = backend
            .get_with_version("global", "count")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, "100", "no increment may be lost");
    }

    #[tokio::test]
    async fn polling_failover_moves_file_processing_to_the_survivor() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let input_dir = input.path().to_str().unwrap().to_string();

        // two nodes share one store and one input directory
        let store = Arc::new(InMemoryStore::new());
        let backend: Arc<dyn MapBackend> = Arc::new(InMemoryMapBackend::new());
        let node_a = clustered_engine("node-a", store.clone(), backend.clone());
        let node_b = clustered_engine("node-b", store.clone(), backend);
        node_a.start().await.unwrap();
        node_b.start().await.unwrap();

        let channel = |_: &str| {
            let mut reader = FileReaderSettings {
                input_dir: input_dir.clone(),
                move_to_dir: None,
                ..Default::default()
            };
            reader.poll_interval = Duration::from_millis(50);
            ChannelConfig::new("poll", "Polled", SourceConfig::file_reader(reader))
                .add_destination(DestinationConfig::new(
                    1,
                    "Out",
                    DestinationKind::FileWriter(FileWriterSettings {
                        output_dir: output.path().to_str().unwrap().to_string(),
                        file_name: "${message_id}.out".to_string(),
                        append: false,
                    }),
                ))
        };

        node_a.deploy(channel("a")).await.unwrap();
        node_b.deploy(channel("b")).await.unwrap();
        node_a.start_channel("poll").await.unwrap();
        node_b.start_channel("poll").await.unwrap();

        // at most one node may hold the lease
        tokio::time::sleep(Duration::from_millis(200)).await;
        let lease = store.current_lease("poll").await.unwrap().unwrap();
        let holder = lease.server_id.clone();

        for i in 0..3 {
            std::fs::write(input.path().join(format!("first_{}.txt", i)), "payload").unwrap();
        }
        for _ in 0..100 {
            if std::fs::read_dir(input.path()).unwrap().next().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(
            std::fs::read_dir(input.path()).unwrap().next().is_none(),
            "first batch consumed"
        );

        // kill the holder; the survivor must take over within 1.5 x ttl
        let (dead, survivor) = if holder == "node-a" {
            (node_a.clone(), node_b.clone())
        } else {
            (node_b.clone(), node_a.clone())
        };
        dead.stop_channel("poll").await.unwrap();

        for i in 0..3 {
            std::fs::write(input.path().join(format!("second_{}.txt", i)), "payload").unwrap();
        }
        for _ in 0..200 {
            if std::fs::read_dir(input.path()).unwrap().next().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(
            std::fs::read_dir(input.path()).unwrap().next().is_none(),
            "survivor picked up polling after failover"
        );
        let lease = store.current_lease("poll").await.unwrap().unwrap();
        assert_eq!(lease.server_id, survivor.server_id());

        // every file produced exactly one output
        let outputs = std::fs::read_dir(output.path()).unwrap().count();
        assert_eq!(outputs, 6, "no file processed twice, none lost");

        survivor.stop_channel("poll").await.unwrap();
        node_a.shutdown().await.unwrap();
        node_b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cluster_events_reach_the_other_node() {
        let store = Arc::new(InMemoryStore::new());
        let backend: Arc<dyn MapBackend> = Arc::new(InMemoryMapBackend::new());
        let node_a = clustered_engine("node-a", store.clone(), backend.clone());
        let node_b = clustered_engine("node-b", store.clone(), backend);
        node_a.start().await.unwrap();
        node_b.start().await.unwrap();

        let mut events_on_b = node_b.event_bus().subscribe();
        node_a
            .deploy(ChannelConfig::new(
                "evt",
                "Events",
                SourceConfig::channel_reader(),
            ))
            .await
            .unwrap();

        // node B observes node A's deploy through the shared event table
        let envelope = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let envelope = events_on_b.recv().await.unwrap();
                if matches!(envelope.event, EngineEvent::ChannelDeployed { .. }) {
                    break envelope;
                }
            }
        })
        .await
        .expect("deploy event never crossed the cluster");
        assert_eq!(envelope.server_id, "node-a");

        node_a.shutdown().await.unwrap();
        node_b.shutdown().await.unwrap();
    }
}
