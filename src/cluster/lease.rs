//! Exclusive polling lease per channel
//!
//! One `polling_leases` row per channel is the authoritative record of which
//! node may poll. Nodes race to insert on channel start; the holder renews
//! at half the ttl and everyone else retries on the same cadence, stealing
//! only once the row has expired. A crashed holder is therefore replaced
//! within 1.5 x ttl.

use crate::error::Result;
use crate::store::LeaseStore;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Factory for per-channel lease tasks
pub struct PollingLeaseManager {
    store: Arc<dyn LeaseStore>,
    server_id: String,
    ttl: Duration,
}

impl PollingLeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, server_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            server_id: server_id.into(),
            ttl,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Start the acquire/renew loop for one channel. The returned handle
    /// reports whether this node currently holds the lease; the task runs
    /// until `shutdown` flips to true, then releases the lease.
    pub fn spawn(&self, channel_id: &str, mut shutdown: watch::Receiver<bool>) -> LeaseHandle {
        let store = self.store.clone();
        let server_id = self.server_id.clone();
        let ttl = self.ttl;
        let channel_id = channel_id.to_string();
        // Epoch millis the lease is held until; 0 while not held. The poller
        // consults this before every poll, so a missed renewal stops polling
        // even while the task is still retrying.
        let held_until = Arc::new(AtomicI64::new(0));

        let held = held_until.clone();
        let task_channel = channel_id.clone();
        let task = tokio::spawn(async move {
            let mut holding = false;
            loop {
                let acquired = if holding {
                    match store.renew(&task_channel, &server_id, ttl).await {
                        Ok(renewed) => renewed,
                        Err(e) => {
                            warn!(channel_id = %task_channel, error = %e, "lease renewal failed");
                            false
                        }
                    }
                } else {
                    match store.try_acquire(&task_channel, &server_id, ttl).await {
                        Ok(acquired) => acquired,
                        Err(e) => {
                            warn!(channel_id = %task_channel, error = %e, "lease acquisition failed");
                            false
                        }
                    }
                };

                if acquired {
                    let until = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
                    held.store(until, Ordering::SeqCst);
                    if !holding {
                        info!(channel_id = %task_channel, server_id = %server_id, "polling lease acquired");
                    }
                } else {
                    held.store(0, Ordering::SeqCst);
                    if holding {
                        info!(channel_id = %task_channel, server_id = %server_id, "polling lease lost");
                    }
                }
                holding = acquired;

                let wait = ttl / 2;
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
            }

            held.store(0, Ordering::SeqCst);
            if holding {
                if let Err(e) = store.release(&task_channel, &server_id).await {
                    warn!(channel_id = %task_channel, error = %e, "lease release failed");
                } else {
                    debug!(channel_id = %task_channel, "polling lease released");
                }
            }
        });

        LeaseHandle {
            channel_id,
            held_until,
            task,
        }
    }
}

/// Live view of one channel's lease from this node's perspective
pub struct LeaseHandle {
    channel_id: String,
    held_until: Arc<AtomicI64>,
    task: tokio::task::JoinHandle<()>,
}

impl LeaseHandle {
    /// Whether this node holds an unexpired lease right now. Checked before
    /// every poll; the stored row stays authoritative because the deadline
    /// only moves forward on a successful renew.
    pub fn is_held(&self) -> bool {
        let until = self.held_until.load(Ordering::SeqCst);
        until != 0 && Utc::now().timestamp_millis() < until
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Wait for the background task to finish after shutdown was signalled
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Convenience for callers that only need a one-shot check
pub async fn lease_is_free(store: &dyn LeaseStore, channel_id: &str) -> Result<bool> {
    match store.current_lease(channel_id).await? {
        Some(lease) => Ok(lease.expires_at < Utc::now()),
        None => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn only_one_node_holds_the_lease() {
        let store = Arc::new(InMemoryStore::new());
        let ttl = Duration::from_millis(200);
        let manager_a = PollingLeaseManager::new(store.clone(), "node-a", ttl);
        let manager_b = PollingLeaseManager::new(store.clone(), "node-b", ttl);

        let (stop_a_tx, stop_a_rx) = shutdown_pair();
        let (stop_b_tx, stop_b_rx) = shutdown_pair();
        let handle_a = manager_a.spawn("chan", stop_a_rx);
        let handle_b = manager_b.spawn("chan", stop_b_rx);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(handle_a.is_held() ^ handle_b.is_held(), "exactly one holder");

        stop_a_tx.send(true).unwrap();
        stop_b_tx.send(true).unwrap();
        handle_a.join().await;
        handle_b.join().await;
    }

    #[tokio::test]
    async fn lease_fails_over_when_holder_stops() {
        let store = Arc::new(InMemoryStore::new());
        let ttl = Duration::from_millis(120);
        let manager_a = PollingLeaseManager::new(store.clone(), "node-a", ttl);
        let manager_b = PollingLeaseManager::new(store.clone(), "node-b", ttl);

        let (stop_a_tx, stop_a_rx) = shutdown_pair();
        let handle_a = manager_a.spawn("chan", stop_a_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle_a.is_held());

        let (stop_b_tx, stop_b_rx) = shutdown_pair();
        let handle_b = manager_b.spawn("chan", stop_b_rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle_b.is_held(), "cannot steal an unexpired lease");

        // Abrupt stop: abort without release, as in a crash. The lease must
        // converge onto node B within 1.5 x ttl.
        handle_a.task.abort();
        tokio::time::sleep(ttl + ttl / 2 + Duration::from_millis(80)).await;
        assert!(handle_b.is_held(), "node B takes over after expiry");

        let lease = store.current_lease("chan").await.unwrap().unwrap();
        assert_eq!(lease.server_id, "node-b");

        stop_b_tx.send(true).unwrap();
        handle_b.join().await;
        // graceful shutdown releases the row
        assert!(store.current_lease("chan").await.unwrap().is_none());
        drop(stop_a_tx);
    }

    #[tokio::test]
    async fn handle_expires_without_renewal() {
        let store = Arc::new(InMemoryStore::new());
        let ttl = Duration::from_millis(60);
        let manager = PollingLeaseManager::new(store.clone(), "node-a", ttl);
        let (stop_tx, stop_rx) = shutdown_pair();
        let handle = manager.spawn("chan", stop_rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.is_held());

        // Freeze renewal by aborting the task; the in-memory deadline must
        // lapse on its own.
        handle.task.abort();
        tokio::time::sleep(ttl + Duration::from_millis(40)).await;
        assert!(!handle.is_held());
        drop(stop_tx);
    }
}
