//! Destination queue behavior: retry, ordering policies, send-first

use async_trait::async_trait;
use meridian::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Transport double: scripted failures per payload, records successful sends
struct MockTransport {
    /// payload -> number of times it should fail before succeeding
    failures: Mutex<HashMap<String, u32>>,
    /// always fail regardless of payload
    always_fail: bool,
    calls: AtomicU32,
    delivered: Mutex<Vec<String>>,
}

impl MockTransport {
    fn reliable() -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(HashMap::new()),
            always_fail: false,
            calls: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(HashMap::new()),
            always_fail: true,
            calls: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn flaky(failures: &[(&str, u32)]) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(
                failures
                    .iter()
                    .map(|(payload, count)| (payload.to_string(), *count))
                    .collect(),
            ),
            always_fail: false,
            calls: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl DispatchTransport for MockTransport {
    async fn send(&self, _target: &str, payload: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail {
            return Err(EngineError::Transport("connection refused".to_string()));
        }
        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(payload) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::Transport("connection reset".to_string()));
            }
        }
        drop(failures);
        self.delivered.lock().push(payload.to_string());
        Ok("ACK".to_string())
    }
}

fn test_engine(store: Arc<InMemoryStore>, transport: Arc<MockTransport>) -> Arc<Engine> {
    let config = Config::for_testing();
    let maps = Arc::new(GlobalMaps::new(Arc::new(InMemoryMapBackend::new())));
    let bus = Arc::new(LocalEventBus::new(config.server_id()));
    let engine = Engine::new(config, store, bus, maps, Arc::new(PassthroughScriptEngine));
    engine.register_transport("mock", transport);
    engine
}

fn transport_destination(queue: QueueSettings) -> DestinationConfig {
    let mut dest = DestinationConfig::new(
        1,
        "Mock Out",
        DestinationKind::Transport {
            transport: "mock".to_string(),
            target: "remote".to_string(),
        },
    );
    dest.queue = queue;
    dest
}

async fn wait_for_status(
    store: &InMemoryStore,
    channel_id: &str,
    message_id: i64,
    expected: Status,
) {
    for _ in 0..200 {
        let status = store
            .connector_message_status(channel_id, message_id, 1)
            .await
            .unwrap();
        if status == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "message {} never reached {:?}",
        message_id,
        expected
    );
}

#[cfg(test)]
mod queue_tests {
    use super::*;

    #[tokio::test]
    async fn retry_exhaustion_finalizes_as_error() {
        let store = Arc::new(InMemoryStore::new());
        let transport = MockTransport::failing();
        let engine = test_engine(store.clone(), transport.clone());
        engine.start().await.unwrap();

        let queue = QueueSettings {
            enabled: true,
            send_first: false,
            retry_count: 3,
            retry_interval: Duration::from_millis(10),
            policy: QueuePolicy::StrictOrder,
            threads: 1,
        };
        let channel = ChannelConfig::new("retry", "Retry", SourceConfig::channel_reader())
            .add_destination(transport_destination(queue));
        engine.deploy(channel).await.unwrap();
        engine.start_channel("retry").await.unwrap();

        engine
            .dispatch_raw_message("retry", RawMessage::new("doomed"))
            .await
            .unwrap();

        wait_for_status(&store, "retry", 1, Status::Error).await;
        // retry_count = 3 means four attempts in total
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
        let error = store
            .load_content("retry", 1, 1, ContentType::ProcessingError)
            .await
            .unwrap()
            .expect("processing error recorded");
        assert!(error.content.contains("connection refused"));
    }

    #[tokio::test]
    async fn synchronous_dispatch_retries_on_the_source_thread() {
        let store = Arc::new(InMemoryStore::new());
        let transport = MockTransport::failing();
        let engine = test_engine(store.clone(), transport.clone());
        engine.start().await.unwrap();

        let queue = QueueSettings {
            enabled: false,
            retry_count: 2,
            retry_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let channel = ChannelConfig::new("syncretry", "SyncRetry", SourceConfig::channel_reader())
            .add_destination(transport_destination(queue));
        engine.deploy(channel).await.unwrap();
        engine.start_channel("syncretry").await.unwrap();

        engine
            .dispatch_raw_message("syncretry", RawMessage::new("doomed"))
            .await
            .unwrap();

        // synchronous path: by the time receive returns, retries are done
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            store
                .connector_message_status("syncretry", 1, 1)
                .await
                .unwrap(),
            Some(Status::Error)
        );
    }

    #[tokio::test]
    async fn strict_order_preserves_enqueue_order_across_failures() {
        let store = Arc::new(InMemoryStore::new());
        // the first message fails twice, then recovers
        let transport = MockTransport::flaky(&[("m1", 2)]);
        let engine = test_engine(store.clone(), transport.clone());
        engine.start().await.unwrap();

        let queue = QueueSettings {
            enabled: true,
            send_first: false,
            retry_count: 5,
            retry_interval: Duration::from_millis(10),
            policy: QueuePolicy::StrictOrder,
            threads: 1,
        };
        let channel = ChannelConfig::new("strict", "Strict", SourceConfig::channel_reader())
            .add_destination(transport_destination(queue));
        engine.deploy(channel).await.unwrap();
        engine.start_channel("strict").await.unwrap();

        for payload in ["m1", "m2", "m3"] {
            engine
                .dispatch_raw_message("strict", RawMessage::new(payload))
                .await
                .unwrap();
        }

        wait_for_status(&store, "strict", 3, Status::Sent).await;
        assert_eq!(
            transport.delivered(),
            vec!["m1".to_string(), "m2".to_string(), "m3".to_string()],
            "head-of-line failure must not reorder deliveries"
        );
    }

    #[tokio::test]
    async fn rotate_on_error_lets_later_messages_through() {
        let store = Arc::new(InMemoryStore::new());
        let transport = MockTransport::flaky(&[("m1", 2)]);
        let engine = test_engine(store.clone(), transport.clone());
        engine.start().await.unwrap();

        let queue = QueueSettings {
            enabled: true,
            send_first: false,
            retry_count: 5,
            retry_interval: Duration::from_millis(10),
            policy: QueuePolicy::RotateOnError,
            threads: 1,
        };
        let channel = ChannelConfig::new("rotate", "Rotate", SourceConfig::channel_reader())
            .add_destination(transport_destination(queue));
        engine.deploy(channel).await.unwrap();
        engine.start_channel("rotate").await.unwrap();

        for payload in ["m1", "m2", "m3"] {
            engine
                .dispatch_raw_message("rotate", RawMessage::new(payload))
                .await
                .unwrap();
        }

        wait_for_status(&store, "rotate", 1, Status::Sent).await;
        let delivered = transport.delivered();
        assert_eq!(delivered.len(), 3);
        assert_ne!(
            delivered[0], "m1",
            "rotation must let a later message go first while m1 cools down"
        );
        assert!(delivered.contains(&"m1".to_string()));
    }

    #[tokio::test]
    async fn send_first_dispatches_before_the_hand_off_returns() {
        let store = Arc::new(InMemoryStore::new());
        let transport = MockTransport::reliable();
        let engine = test_engine(store.clone(), transport.clone());
        engine.start().await.unwrap();

        let queue = QueueSettings {
            enabled: true,
            send_first: true,
            retry_count: 0,
            retry_interval: Duration::from_millis(10),
            policy: QueuePolicy::StrictOrder,
            threads: 1,
        };
        let channel = ChannelConfig::new("fast", "Fast", SourceConfig::channel_reader())
            .add_destination(transport_destination(queue));
        engine.deploy(channel).await.unwrap();
        engine.start_channel("fast").await.unwrap();

        engine
            .dispatch_raw_message("fast", RawMessage::new("eager"))
            .await
            .unwrap();

        // no backlog: the enqueueing thread itself must have dispatched, so
        // the send is already acknowledged when receive returns
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.connector_message_status("fast", 1, 1).await.unwrap(),
            Some(Status::Sent)
        );
    }

    #[tokio::test]
    async fn queued_messages_survive_a_channel_restart() {
        let store = Arc::new(InMemoryStore::new());
        let transport = MockTransport::failing();
        let engine = test_engine(store.clone(), transport.clone());
        engine.start().await.unwrap();

        let queue = QueueSettings {
            enabled: true,
            send_first: false,
            retry_count: 1000,
            retry_interval: Duration::from_millis(50),
            policy: QueuePolicy::StrictOrder,
            threads: 1,
        };
        let channel = ChannelConfig::new("durable", "Durable", SourceConfig::channel_reader())
            .add_destination(transport_destination(queue));
        engine.deploy(channel).await.unwrap();
        engine.start_channel("durable").await.unwrap();

        engine
            .dispatch_raw_message("durable", RawMessage::new("stuck"))
            .await
            .unwrap();
        // give the worker at least one failing attempt
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop_channel("durable").await.unwrap();

        assert_eq!(
            store
                .connector_message_status("durable", 1, 1)
                .await
                .unwrap(),
            Some(Status::Queued)
        );
        let entries = store.queued_entries("durable", 1, 10).await.unwrap();
        assert_eq!(entries.len(), 1);

        // transport recovers; restart recovers the entry and delivers it
        let calls_before = transport.calls.load(Ordering::SeqCst);
        assert!(calls_before >= 1);
        // swap behavior by deploying a fresh reliable transport under the same name
        engine.register_transport("mock", MockTransport::reliable());
        engine.undeploy("durable").await.unwrap();
        let channel = ChannelConfig::new("durable", "Durable", SourceConfig::channel_reader())
            .add_destination(transport_destination(QueueSettings {
                enabled: true,
                send_first: false,
                retry_count: 3,
                retry_interval: Duration::from_millis(10),
                policy: QueuePolicy::StrictOrder,
                threads: 1,
            }));
        engine.deploy(channel).await.unwrap();
        engine.start_channel("durable").await.unwrap();

        wait_for_status(&store, "durable", 1, Status::Sent).await;
    }
}
