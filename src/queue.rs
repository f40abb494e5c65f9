//! Destination queue engine
//!
//! A durable FIFO per destination. The persisted form is the set of
//! connector-message rows in queued status, ordered by message id; the
//! in-memory buffer mirrors it so a restart recovers every unsent entry.
//! One worker per configured thread pops the head, dispatches, and applies
//! the retry policy; the send-first fast path lets the enqueueing thread
//! dispatch directly when the destination has no backlog.

use crate::engine::ChannelSignal;
use crate::error::Result;
use crate::model::{QueuePolicy, QueueSettings};
use crate::pipeline::dispatch::{DestinationDispatcher, DispatchOutcome};
use crate::store::{MessageStore, QueueEntry, Store};
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, Semaphore, watch};
use tracing::{debug, info, warn};

const RECOVERY_BATCH: i64 = 10_000;

pub struct DestinationQueue {
    channel_id: String,
    meta_data_id: i32,
    settings: QueueSettings,
    store: Arc<dyn Store>,
    dispatcher: Arc<DestinationDispatcher>,
    buffer: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
    /// Bounds in-flight sends; also what the fast path races workers for
    permits: Arc<Semaphore>,
    signal: watch::Receiver<ChannelSignal>,
    workers: SyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DestinationQueue {
    pub fn new(
        channel_id: impl Into<String>,
        settings: QueueSettings,
        store: Arc<dyn Store>,
        dispatcher: Arc<DestinationDispatcher>,
        signal: watch::Receiver<ChannelSignal>,
    ) -> Arc<Self> {
        let meta_data_id = dispatcher.config().meta_data_id;
        let threads = settings.threads.max(1);
        Arc::new(Self {
            channel_id: channel_id.into(),
            meta_data_id,
            settings,
            store,
            dispatcher,
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            permits: Arc::new(Semaphore::new(threads)),
            signal,
            workers: SyncMutex::new(Vec::new()),
        })
    }

    /// Reload unsent entries from the store, then start the workers
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let recovered = self
            .store
            .queued_entries(&self.channel_id, self.meta_data_id, RECOVERY_BATCH)
            .await?;
        if !recovered.is_empty() {
            info!(
                channel_id = %self.channel_id,
                meta_data_id = self.meta_data_id,
                count = recovered.len(),
                "recovered queued messages"
            );
        }
        // the store is authoritative; entries left over from a previous run
        // of the workers are re-read, not appended
        let mut buffer = self.buffer.lock().await;
        buffer.clear();
        buffer.extend(recovered);
        drop(buffer);

        let threads = self.settings.threads.max(1);
        let mut workers = self.workers.lock();
        for worker_id in 0..threads {
            let queue = self.clone();
            workers.push(tokio::spawn(async move {
                queue.worker_loop(worker_id).await;
            }));
        }
        Ok(())
    }

    /// Wait for all workers to exit; called after the stop signal flips
    pub async fn join(&self) {
        let workers: Vec<_> = {
            let mut guard = self.workers.lock();
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
    }

    pub async fn depth(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Hand a freshly persisted entry to the queue. With send-first set and
    /// no backlog, the calling (source) thread dispatches the entry itself
    /// before the synchronous hand-off completes; a worker never sees an
    /// entry the fast path claimed, because the claim happens before the
    /// entry reaches the buffer.
    pub async fn submit(self: &Arc<Self>, entry: QueueEntry) -> Result<()> {
        if self.settings.send_first {
            let backlog_empty = self.buffer.lock().await.is_empty();
            if backlog_empty {
                if let Ok(permit) = self.permits.clone().try_acquire_owned() {
                    debug!(
                        channel_id = %self.channel_id,
                        message_id = entry.message_id,
                        "send-first fast path"
                    );
                    let outcome = self.attempt(&entry).await;
                    drop(permit);
                    match outcome {
                        AttemptResult::Delivered | AttemptResult::Exhausted => return Ok(()),
                        AttemptResult::Retry(entry) => {
                            // fast path only gets the first attempt; the rest
                            // belong to the workers
                            self.buffer.lock().await.push_back(entry);
                            self.notify.notify_one();
                            return Ok(());
                        }
                        AttemptResult::Halted => return Ok(()),
                    }
                }
            }
        }

        self.buffer.lock().await.push_back(entry);
        self.notify.notify_one();
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let mut signal = self.signal.clone();
        debug!(
            channel_id = %self.channel_id,
            meta_data_id = self.meta_data_id,
            worker_id,
            "queue worker started"
        );
        loop {
            if *signal.borrow() != ChannelSignal::Run {
                break;
            }

            let entry = { self.buffer.lock().await.pop_front() };
            let Some(entry) = entry else {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    changed = signal.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            };

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let outcome = tokio::select! {
                outcome = self.attempt(&entry) => outcome,
                _ = wait_for_halt(&mut signal) => {
                    // in-flight send interrupted by halt
                    let attempts = entry.attempts + 1;
                    if let Err(e) = self.dispatcher.record_halted(entry.message_id, attempts).await {
                        warn!(message_id = entry.message_id, error = %e, "failed to record halt");
                    }
                    AttemptResult::Halted
                }
            };
            drop(permit);

            match outcome {
                AttemptResult::Delivered | AttemptResult::Exhausted => {}
                AttemptResult::Halted => break,
                AttemptResult::Retry(entry) => {
                    let wait = self.settings.retry_interval;
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = wait_for_halt(&mut signal) => break,
                    }
                    let mut buffer = self.buffer.lock().await;
                    match self.settings.policy {
                        // head stays at head until it succeeds or exhausts
                        QueuePolicy::StrictOrder => buffer.push_front(entry),
                        // give later messages a chance, come back around
                        QueuePolicy::RotateOnError => buffer.push_back(entry),
                    }
                    drop(buffer);
                    self.notify.notify_one();
                }
            }
        }
        debug!(
            channel_id = %self.channel_id,
            meta_data_id = self.meta_data_id,
            worker_id,
            "queue worker stopped"
        );
    }

    /// One dispatch attempt for one entry, with its outcome persisted
    async fn attempt(&self, entry: &QueueEntry) -> AttemptResult {
        let attempts = entry.attempts + 1;
        let payload = match self.dispatcher.load_payload(entry.message_id).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    channel_id = %self.channel_id,
                    message_id = entry.message_id,
                    error = %e,
                    "queued message has no payload"
                );
                let _ = self
                    .dispatcher
                    .record_failure(entry.message_id, attempts, &e.to_string(), false)
                    .await;
                return AttemptResult::Exhausted;
            }
        };

        match self.dispatcher.dispatch_once(entry.message_id, &payload).await {
            DispatchOutcome::Delivered(response) => {
                if let Err(e) = self
                    .dispatcher
                    .record_success(entry.message_id, attempts, &response)
                    .await
                {
                    warn!(
                        message_id = entry.message_id,
                        error = %e,
                        "failed to record successful dispatch"
                    );
                }
                AttemptResult::Delivered
            }
            DispatchOutcome::Failed { error, retryable } => {
                let exhausted = !retryable || attempts > self.settings.retry_count;
                if let Err(e) = self
                    .dispatcher
                    .record_failure(entry.message_id, attempts, &error, !exhausted)
                    .await
                {
                    warn!(
                        message_id = entry.message_id,
                        error = %e,
                        "failed to record dispatch failure"
                    );
                }
                if exhausted {
                    AttemptResult::Exhausted
                } else {
                    AttemptResult::Retry(QueueEntry {
                        message_id: entry.message_id,
                        attempts,
                    })
                }
            }
        }
    }
}

enum AttemptResult {
    Delivered,
    Retry(QueueEntry),
    Exhausted,
    Halted,
}

async fn wait_for_halt(signal: &mut watch::Receiver<ChannelSignal>) {
    loop {
        if *signal.borrow() == ChannelSignal::Halt {
            return;
        }
        if signal.changed().await.is_err() {
            // engine gone; treat as halt
            return;
        }
    }
}
