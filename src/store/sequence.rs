//! Block-allocated monotonic message ids
//!
//! The allocator reserves a block of ids from the sequence row per store
//! round-trip and hands them out one at a time in memory. Refill is
//! serialized per channel so two exhausting callers never both advance the
//! row; hand-out between refills touches only the per-channel mutex.

use super::SequenceStore;
use crate::error::{EngineError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const REFILL_ATTEMPTS: u32 = 5;
const REFILL_BACKOFF_BASE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Block {
    /// Next id to hand out; block is exhausted when next == end
    next: i64,
    end: i64,
}

/// Per-channel block allocator for message ids.
///
/// Ids are strictly increasing per channel within one process. Across a
/// cluster they are unique but not globally ordered, and blocks abandoned on
/// restart leave gaps.
pub struct SequenceAllocator {
    store: Arc<dyn SequenceStore>,
    block_size: i64,
    channels: DashMap<String, Arc<Mutex<Block>>>,
}

impl SequenceAllocator {
    pub fn new(store: Arc<dyn SequenceStore>, block_size: i64) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self {
            store,
            block_size,
            channels: DashMap::new(),
        }
    }

    /// Allocate the next message id for a channel
    pub async fn next_id(&self, channel_id: &str) -> Result<i64> {
        let cell = self
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Block::default())))
            .clone();

        let mut block = cell.lock().await;
        if block.next >= block.end {
            let first = self.refill(channel_id).await?;
            debug!(
                channel_id,
                first,
                block_size = self.block_size,
                "reserved message id block"
            );
            block.next = first;
            block.end = first + self.block_size;
        }
        let id = block.next;
        block.next += 1;
        Ok(id)
    }

    /// Drop the cached block for a channel (undeploy); the unused remainder
    /// of the block becomes a gap
    pub fn forget_channel(&self, channel_id: &str) {
        self.channels.remove(channel_id);
    }

    async fn refill(&self, channel_id: &str) -> Result<i64> {
        let mut delay = REFILL_BACKOFF_BASE;
        let mut last_error = None;
        for attempt in 1..=REFILL_ATTEMPTS {
            match self.store.advance_block(channel_id, self.block_size).await {
                Ok(first) => return Ok(first),
                Err(e) => {
                    warn!(
                        channel_id,
                        attempt,
                        error = %e,
                        "sequence block reservation failed"
                    );
                    last_error = Some(e);
                    if attempt < REFILL_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(EngineError::Allocation(format!(
            "channel {}: {}",
            channel_id,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    struct CountingStore {
        next: AtomicI64,
        calls: AtomicU32,
        fail_first: AtomicU32,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                next: AtomicI64::new(1),
                calls: AtomicU32::new(0),
                fail_first: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SequenceStore for CountingStore {
        async fn advance_block(&self, _channel_id: &str, block_size: i64) -> Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Driver("connection reset".into()).into());
            }
            Ok(self.next.fetch_add(block_size, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn issues_exactly_block_size_ids_per_store_call() {
        let store = Arc::new(CountingStore::new());
        let allocator = SequenceAllocator::new(store.clone(), 10);

        for expected in 1..=10 {
            assert_eq!(allocator.next_id("c").await.unwrap(), expected);
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        assert_eq!(allocator.next_id("c").await.unwrap(), 11);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing_under_concurrency() {
        let store = Arc::new(CountingStore::new());
        let allocator = Arc::new(SequenceAllocator::new(store, 7));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = allocator.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..25 {
                    ids.push(alloc.next_id("c").await.unwrap());
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count, "duplicate ids were issued");
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let store = Arc::new(CountingStore::new());
        let allocator = SequenceAllocator::new(store, 5);

        let a = allocator.next_id("a").await.unwrap();
        let b = allocator.next_id("b").await.unwrap();
        assert_ne!(a, b, "blocks come from the shared sequence");
        assert!(allocator.next_id("a").await.unwrap() > a);
    }

    #[tokio::test]
    async fn refill_retries_transient_store_errors() {
        let store = Arc::new(CountingStore::new());
        store.fail_first.store(2, Ordering::SeqCst);
        let allocator = SequenceAllocator::new(store.clone(), 3);

        let id = allocator.next_id("c").await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }
}
