//! Durable persistence layer
//!
//! The store owns all persisted state: core metadata tables, the per-channel
//! message tables, the sequence rows, cluster events, polling leases and the
//! shared map rows. One DAO trait family covers every persistent entity; the
//! engine holds a single `Arc<dyn Store>` and the two implementations
//! (`SqlStore` for Postgres, `InMemoryStore` for single-node and tests)
//! honor the same contracts, CAS and lease semantics included.

pub mod encryption;
pub mod memory;
pub mod sequence;
pub mod sql;

pub use encryption::{AesContentEncryptor, ContentEncryptor, NoopEncryptor};
pub use memory::InMemoryStore;
pub use sequence::SequenceAllocator;
pub use sql::SqlStore;

use crate::error::{Result, StoreError};
use crate::model::{
    Attachment, ChannelConfig, ConnectorMessage, ContentType, Message, MessageContent,
    MetadataColumn, MetadataValue, Status,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// One persisted destination-queue entry awaiting dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub message_id: i64,
    /// Attempts already made; the worker continues from here after a restart
    pub attempts: u32,
}

/// The polling lease row for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub channel_id: String,
    pub server_id: String,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One row of the append-only cluster event log
#[derive(Debug, Clone)]
pub struct ClusterEventRow {
    pub id: i64,
    pub channel: String,
    pub data: String,
    pub created_at: DateTime<Utc>,
    pub server_id: String,
}

/// A node registered in the shared store
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server_id: String,
    pub hostname: String,
    pub port: Option<i32>,
    pub api_url: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: String,
}

/// DAO for messages, content, attachments and per-channel schema
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Idempotently create the core and cluster tables
    async fn ensure_core_tables(&self) -> Result<()>;

    /// Idempotently create the per-channel message tables
    async fn create_channel_tables(&self, channel_id: &str) -> Result<()>;

    /// Drop the per-channel tables; only called when a channel is removed
    async fn remove_channel_tables(&self, channel_id: &str) -> Result<()>;

    /// Converge the custom metadata table's columns onto the declared set
    async fn sync_metadata_columns(
        &self,
        channel_id: &str,
        columns: &[MetadataColumn],
    ) -> Result<()>;

    /// Current non-built-in column names on the custom metadata table
    async fn metadata_column_names(&self, channel_id: &str) -> Result<Vec<String>>;

    /// Persist the channel configuration row
    async fn upsert_channel(&self, config: &ChannelConfig) -> Result<()>;

    async fn insert_message(&self, message: &Message) -> Result<()>;

    async fn mark_processed(&self, channel_id: &str, message_id: i64) -> Result<()>;

    async fn insert_connector_message(&self, cm: &ConnectorMessage) -> Result<()>;

    async fn update_status(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
        status: Status,
    ) -> Result<()>;

    /// Record the outcome of a dispatch attempt in one write
    #[allow(clippy::too_many_arguments)]
    async fn update_send_result(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
        status: Status,
        send_attempts: u32,
        send_date: Option<DateTime<Utc>>,
        response_date: Option<DateTime<Utc>>,
        processing_error: Option<&str>,
    ) -> Result<()>;

    async fn connector_message_status(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
    ) -> Result<Option<Status>>;

    /// Write one content row; encrypts transparently when an encryptor is
    /// installed
    async fn store_content(&self, channel_id: &str, content: &MessageContent) -> Result<()>;

    /// Read one content row back, decrypting when the row is flagged
    async fn load_content(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
        content_type: ContentType,
    ) -> Result<Option<MessageContent>>;

    async fn store_metadata_values(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
        values: &HashMap<String, MetadataValue>,
    ) -> Result<()>;

    async fn insert_attachment(&self, channel_id: &str, attachment: &Attachment) -> Result<()>;

    async fn load_attachment(
        &self,
        channel_id: &str,
        message_id: i64,
        attachment_id: &str,
    ) -> Result<Option<Attachment>>;

    /// Unsent queue entries for one destination, ordered by message id.
    /// Restart recovery loads the queue buffer from this.
    async fn queued_entries(
        &self,
        channel_id: &str,
        meta_data_id: i32,
        limit: i64,
    ) -> Result<Vec<QueueEntry>>;
}

/// DAO for node registration, deployments and the audit trail
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn register_server(&self, info: &ServerInfo) -> Result<()>;

    async fn heartbeat(&self, server_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn record_deployment(&self, server_id: &str, channel_id: &str) -> Result<()>;

    async fn remove_deployment(&self, server_id: &str, channel_id: &str) -> Result<()>;

    /// Append one audit-trail event row
    async fn audit_event(
        &self,
        name: &str,
        level: &str,
        outcome: &str,
        attributes: &str,
        server_id: &str,
    ) -> Result<()>;
}

/// Block allocation for per-channel message ids
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Advance the stored next-id by `block_size` under a row lock and
    /// return the first id of the reserved block
    async fn advance_block(&self, channel_id: &str, block_size: i64) -> Result<i64>;
}

/// The polling-lease row, the single source of truth for "who polls"
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert the lease row, or steal it if expired, or re-take our own.
    /// Returns true when we hold the lease afterwards.
    async fn try_acquire(&self, channel_id: &str, server_id: &str, ttl: Duration) -> Result<bool>;

    /// Extend our unexpired lease; returns false when it was lost
    async fn renew(&self, channel_id: &str, server_id: &str, ttl: Duration) -> Result<bool>;

    /// Drop our lease so another node can take it immediately
    async fn release(&self, channel_id: &str, server_id: &str) -> Result<()>;

    async fn current_lease(&self, channel_id: &str) -> Result<Option<Lease>>;
}

/// Append-only cluster event log backing the polling event bus
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_cluster_event(&self, channel: &str, data: &str, server_id: &str)
    -> Result<i64>;

    /// Events with `id > last_seen` not produced by `exclude_server`
    async fn cluster_events_after(
        &self,
        last_seen: i64,
        exclude_server: &str,
    ) -> Result<Vec<ClusterEventRow>>;

    async fn latest_cluster_event_id(&self) -> Result<i64>;
}

/// Everything the engine needs from a store backend
pub trait Store:
    MessageStore + ClusterStore + SequenceStore + LeaseStore + EventStore + 'static
{
}

impl<T> Store for T where
    T: MessageStore + ClusterStore + SequenceStore + LeaseStore + EventStore + 'static
{
}

/// Derive the per-channel table suffix from a channel id.
///
/// Hyphens are stripped (UUID-style ids collapse to hex); anything else
/// outside `[A-Za-z0-9_]` is rejected so channel ids can never smuggle SQL
/// into the dynamically named DDL.
pub fn table_suffix(channel_id: &str) -> Result<String> {
    let local: String = channel_id.chars().filter(|c| *c != '-').collect();
    if local.is_empty() {
        return Err(StoreError::Schema(format!("unusable channel id '{}'", channel_id)).into());
    }
    if !local.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::Schema(format!(
            "channel id '{}' contains characters not allowed in table names",
            channel_id
        ))
        .into());
    }
    Ok(local.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_suffix_strips_hyphens_and_lowercases() {
        let suffix = table_suffix("3A5b-77f2-C9").unwrap();
        assert_eq!(suffix, "3a5b77f2c9");
    }

    #[test]
    fn table_suffix_rejects_hostile_ids() {
        assert!(table_suffix("a;drop table m").is_err());
        assert!(table_suffix("a b").is_err());
        assert!(table_suffix("--").is_err());
        assert!(table_suffix("").is_err());
    }
}
