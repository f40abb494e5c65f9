//! Cluster event bus
//!
//! Broadcasts channel-status and engine events across the cluster. Three
//! substitutable backends, chosen by configuration: in-process only,
//! database polling over the append-only `cluster_events` table, and Redis
//! pub/sub. Non-local backends are at-least-once; subscribers must tolerate
//! duplicates.

use crate::error::Result;
use crate::store::EventStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

const LOCAL_CHANNEL_CAPACITY: usize = 256;

/// Events published by the engine and its channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    ChannelDeployed {
        channel_id: String,
    },
    ChannelUndeployed {
        channel_id: String,
    },
    ChannelStateChanged {
        channel_id: String,
        state: String,
    },
    MessageProcessed {
        channel_id: String,
        message_id: i64,
    },
    LeaseTransition {
        channel_id: String,
        server_id: String,
        acquired: bool,
    },
    ShadowModeChanged {
        enabled: bool,
    },
}

impl EngineEvent {
    /// Topic the event is filed under in the cluster event log
    pub fn topic(&self) -> &str {
        match self {
            EngineEvent::ChannelDeployed { channel_id }
            | EngineEvent::ChannelUndeployed { channel_id }
            | EngineEvent::ChannelStateChanged { channel_id, .. }
            | EngineEvent::MessageProcessed { channel_id, .. }
            | EngineEvent::LeaseTransition { channel_id, .. } => channel_id,
            EngineEvent::ShadowModeChanged { .. } => "engine",
        }
    }
}

/// An event together with its origin, as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Log id for database-polled events; 0 for local and Redis delivery
    pub id: i64,
    pub server_id: String,
    pub created_at: DateTime<Utc>,
    pub event: EngineEvent,
}

/// Pub/sub fan-out for engine events
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: EngineEvent) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope>;

    /// Spawn any backend tasks (pollers, subscriber connections)
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}
}

/// In-process dispatch; subscribers on this node only
pub struct LocalEventBus {
    server_id: String,
    tx: broadcast::Sender<EventEnvelope>,
}

impl LocalEventBus {
    pub fn new(server_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        Self {
            server_id: server_id.into(),
            tx,
        }
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        // A send error only means nobody is subscribed right now
        let _ = self.tx.send(EventEnvelope {
            id: 0,
            server_id: self.server_id.clone(),
            created_at: Utc::now(),
            event,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

/// Database-polled event bus over the `cluster_events` table.
///
/// Publishing appends to the table and dispatches locally in the same call,
/// so this node's subscribers never wait a poll cycle for their own events.
/// The poll task picks up rows from other servers only.
pub struct DbPollingEventBus {
    store: Arc<dyn EventStore>,
    server_id: String,
    poll_interval: Duration,
    tx: broadcast::Sender<EventEnvelope>,
    last_seen: Arc<AtomicI64>,
    shutdown: watch::Sender<bool>,
    poller: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DbPollingEventBus {
    pub fn new(
        store: Arc<dyn EventStore>,
        server_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        let (tx, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            server_id: server_id.into(),
            poll_interval,
            tx,
            last_seen: Arc::new(AtomicI64::new(0)),
            shutdown,
            poller: Mutex::new(None),
        }
    }
}

#[async_trait]
impl EventBus for DbPollingEventBus {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        let data = serde_json::to_string(&event)?;
        let id = self
            .store
            .append_cluster_event(event.topic(), &data, &self.server_id)
            .await?;
        let _ = self.tx.send(EventEnvelope {
            id,
            server_id: self.server_id.clone(),
            created_at: Utc::now(),
            event,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    async fn start(&self) -> Result<()> {
        // Start from the current tail; history is not replayed
        let latest = self.store.latest_cluster_event_id().await?;
        self.last_seen.store(latest, Ordering::SeqCst);

        let store = self.store.clone();
        let server_id = self.server_id.clone();
        let tx = self.tx.clone();
        let last_seen = self.last_seen.clone();
        let interval = self.poll_interval;
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                let seen = last_seen.load(Ordering::SeqCst);
                match store.cluster_events_after(seen, &server_id).await {
                    Ok(rows) => {
                        for row in rows {
                            last_seen.fetch_max(row.id, Ordering::SeqCst);
                            match serde_json::from_str::<EngineEvent>(&row.data) {
                                Ok(event) => {
                                    let _ = tx.send(EventEnvelope {
                                        id: row.id,
                                        server_id: row.server_id,
                                        created_at: row.created_at,
                                        event,
                                    });
                                }
                                Err(e) => {
                                    warn!(event_id = row.id, error = %e, "undecodable cluster event")
                                }
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "cluster event poll failed"),
                }
            }
            debug!("cluster event poller stopped");
        });
        *self.poller.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}

/// Redis pub/sub event bus; one connection publishes, a dedicated task
/// holds the subscriber connection. Preferred backend when Redis is
/// available.
pub struct RedisEventBus {
    client: redis::Client,
    server_id: String,
    topic: String,
    tx: broadcast::Sender<EventEnvelope>,
    shutdown: watch::Sender<bool>,
    subscriber: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RedisEventBus {
    pub fn new(redis_url: &str, server_id: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(crate::error::StoreError::from)?;
        let (tx, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            server_id: server_id.into(),
            topic: "meridian:events".to_string(),
            tx,
            shutdown,
            subscriber: Mutex::new(None),
        })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        let envelope = EventEnvelope {
            id: 0,
            server_id: self.server_id.clone(),
            created_at: Utc::now(),
            event,
        };
        let payload = serde_json::to_string(&envelope)?;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.publish(&self.topic, payload).await?;

        // Local dispatch skips the Redis round-trip; the subscriber task
        // filters out this node's own deliveries.
        let _ = self.tx.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    async fn start(&self) -> Result<()> {
        let client = self.client.clone();
        let topic = self.topic.clone();
        let server_id = self.server_id.clone();
        let tx = self.tx.clone();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        warn!(error = %e, "redis subscribe connection failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                if let Err(e) = pubsub.subscribe(&topic).await {
                    warn!(error = %e, "redis subscribe failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                let mut stream = pubsub.on_message();
                loop {
                    tokio::select! {
                        message = stream.next() => {
                            let Some(message) = message else { break };
                            let payload: String = match message.get_payload() {
                                Ok(payload) => payload,
                                Err(e) => {
                                    warn!(error = %e, "unreadable redis event payload");
                                    continue;
                                }
                            };
                            match serde_json::from_str::<EventEnvelope>(&payload) {
                                Ok(envelope) if envelope.server_id != server_id => {
                                    let _ = tx.send(envelope);
                                }
                                Ok(_) => {} // our own publish, already dispatched
                                Err(e) => warn!(error = %e, "undecodable redis event"),
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
                warn!("redis event stream closed, reconnecting");
            }
        });
        *self.subscriber.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.subscriber.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn local_bus_dispatches_to_subscribers() {
        let bus = LocalEventBus::new("node-a");
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::ChannelDeployed {
            channel_id: "c1".into(),
        })
        .await
        .unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.server_id, "node-a");
        assert!(matches!(
            envelope.event,
            EngineEvent::ChannelDeployed { .. }
        ));
    }

    #[tokio::test]
    async fn db_polling_bus_delivers_remote_events_and_skips_own() {
        let store = Arc::new(InMemoryStore::new());
        let bus_a = DbPollingEventBus::new(store.clone(), "node-a", Duration::from_millis(20));
        let bus_b = DbPollingEventBus::new(store.clone(), "node-b", Duration::from_millis(20));
        bus_a.start().await.unwrap();
        bus_b.start().await.unwrap();

        let mut rx_a = bus_a.subscribe();
        let mut rx_b = bus_b.subscribe();

        bus_a
            .publish(EngineEvent::ChannelStateChanged {
                channel_id: "c1".into(),
                state: "STARTED".into(),
            })
            .await
            .unwrap();

        // publisher's subscribers get it immediately, without polling
        let local = rx_a.recv().await.unwrap();
        assert_eq!(local.server_id, "node-a");

        // the other node picks it up from the table
        let remote = tokio::time::timeout(Duration::from_millis(500), rx_b.recv())
            .await
            .expect("remote delivery timed out")
            .unwrap();
        assert_eq!(remote.server_id, "node-a");

        // node A must not receive its own event again via polling
        let duplicate =
            tokio::time::timeout(Duration::from_millis(120), rx_a.recv()).await;
        assert!(duplicate.is_err(), "own event echoed back through the table");

        bus_a.stop().await;
        bus_b.stop().await;
    }
}
