//! In-memory store backend
//!
//! Backs single-node deployments that do not need durability, and the test
//! suite. Implements the full `Store` contract, including content
//! encryption, queue recovery ordering, lease stealing and the append-only
//! event log, with the same observable semantics as the SQL backend.

use super::{
    ClusterEventRow, ClusterStore, EventStore, Lease, LeaseStore, MessageStore, QueueEntry,
    SequenceStore, ServerInfo, table_suffix,
};
use crate::error::{Result, StoreError};
use crate::model::{
    Attachment, ChannelConfig, ConnectorMessage, ContentType, Message, MessageContent,
    MetadataColumn, MetadataValue, Status,
};
use crate::store::encryption::{ContentEncryptor, NoopEncryptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct MessageRow {
    server_id: String,
    received_date: DateTime<Utc>,
    processed: bool,
}

#[derive(Debug, Clone)]
struct ConnectorRow {
    connector_name: String,
    received_date: DateTime<Utc>,
    status: Status,
    send_attempts: u32,
    send_date: Option<DateTime<Utc>>,
    response_date: Option<DateTime<Utc>>,
    processing_error: Option<String>,
    chain_id: i32,
    order_id: i32,
}

#[derive(Default)]
struct ChannelTables {
    messages: DashMap<i64, MessageRow>,
    connector_messages: DashMap<(i64, i32), ConnectorRow>,
    content: DashMap<(i64, i32, i16), MessageContent>,
    metadata_columns: RwLock<Vec<MetadataColumn>>,
    metadata_values: DashMap<(i64, i32), HashMap<String, MetadataValue>>,
    attachments: DashMap<(i64, String), Attachment>,
}

/// DashMap-backed store with the same contract as [`super::SqlStore`]
pub struct InMemoryStore {
    encryptor: Arc<dyn ContentEncryptor>,
    channels: DashMap<String, Arc<ChannelTables>>,
    channel_rows: DashMap<String, ChannelConfig>,
    servers: DashMap<String, ServerInfo>,
    deployments: DashMap<(String, String), DateTime<Utc>>,
    audit_log: Mutex<Vec<(String, String, String, String, String, DateTime<Utc>)>>,
    cluster_events: Mutex<Vec<ClusterEventRow>>,
    next_event_id: AtomicI64,
    leases: DashMap<String, Lease>,
    sequences: DashMap<String, i64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_encryptor(Arc::new(NoopEncryptor))
    }

    pub fn with_encryptor(encryptor: Arc<dyn ContentEncryptor>) -> Self {
        Self {
            encryptor,
            channels: DashMap::new(),
            channel_rows: DashMap::new(),
            servers: DashMap::new(),
            deployments: DashMap::new(),
            audit_log: Mutex::new(Vec::new()),
            cluster_events: Mutex::new(Vec::new()),
            next_event_id: AtomicI64::new(1),
            leases: DashMap::new(),
            sequences: DashMap::new(),
        }
    }

    fn tables(&self, channel_id: &str) -> Result<Arc<ChannelTables>> {
        self.channels
            .get(channel_id)
            .map(|t| t.clone())
            .ok_or_else(|| {
                StoreError::Schema(format!("channel {} tables do not exist", channel_id)).into()
            })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn ensure_core_tables(&self) -> Result<()> {
        Ok(())
    }

    async fn create_channel_tables(&self, channel_id: &str) -> Result<()> {
        // Same identifier restriction as the SQL backend
        table_suffix(channel_id)?;
        self.channels
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(ChannelTables::default()));
        Ok(())
    }

    async fn remove_channel_tables(&self, channel_id: &str) -> Result<()> {
        self.channels.remove(channel_id);
        self.sequences.remove(channel_id);
        Ok(())
    }

    async fn sync_metadata_columns(
        &self,
        channel_id: &str,
        columns: &[MetadataColumn],
    ) -> Result<()> {
        let tables = self.tables(channel_id)?;
        let normalized: Vec<MetadataColumn> = columns
            .iter()
            .map(|c| MetadataColumn {
                name: c.name.to_lowercase(),
                column_type: c.column_type,
                mapping: c.mapping.clone(),
            })
            .collect();
        *tables.metadata_columns.write() = normalized;
        Ok(())
    }

    async fn metadata_column_names(&self, channel_id: &str) -> Result<Vec<String>> {
        let tables = self.tables(channel_id)?;
        Ok(tables
            .metadata_columns
            .read()
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }

    async fn upsert_channel(&self, config: &ChannelConfig) -> Result<()> {
        self.channel_rows
            .insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        let tables = self.tables(&message.channel_id)?;
        match tables.messages.entry(message.message_id) {
            Entry::Occupied(_) => Err(StoreError::Integrity(format!(
                "message {} already exists in channel {}",
                message.message_id, message.channel_id
            ))
            .into()),
            Entry::Vacant(v) => {
                v.insert(MessageRow {
                    server_id: message.server_id.clone(),
                    received_date: message.received_date,
                    processed: message.processed,
                });
                Ok(())
            }
        }
    }

    async fn mark_processed(&self, channel_id: &str, message_id: i64) -> Result<()> {
        let tables = self.tables(channel_id)?;
        if let Some(mut row) = tables.messages.get_mut(&message_id) {
            row.processed = true;
            Ok(())
        } else {
            Err(StoreError::Integrity(format!("message {} not found", message_id)).into())
        }
    }

    async fn insert_connector_message(&self, cm: &ConnectorMessage) -> Result<()> {
        let tables = self.tables(&cm.channel_id)?;
        match tables
            .connector_messages
            .entry((cm.message_id, cm.meta_data_id))
        {
            Entry::Occupied(_) => Err(StoreError::Integrity(format!(
                "connector message ({}, {}) already exists",
                cm.message_id, cm.meta_data_id
            ))
            .into()),
            Entry::Vacant(v) => {
                v.insert(ConnectorRow {
                    connector_name: cm.connector_name.clone(),
                    received_date: cm.received_date,
                    status: cm.status,
                    send_attempts: cm.send_attempts,
                    send_date: cm.send_date,
                    response_date: cm.response_date,
                    processing_error: cm.processing_error.clone(),
                    chain_id: cm.chain_id,
                    order_id: cm.order_id,
                });
                Ok(())
            }
        }
    }

    async fn update_status(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
        status: Status,
    ) -> Result<()> {
        let tables = self.tables(channel_id)?;
        match tables.connector_messages.get_mut(&(message_id, meta_data_id)) {
            Some(mut row) => {
                row.status = status;
                Ok(())
            }
            None => Err(StoreError::Integrity(format!(
                "connector message ({}, {}) not found",
                message_id, meta_data_id
            ))
            .into()),
        }
    }

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
    ) -> Result<()> {
        let tables = self.tables(channel_id)?;
        match tables.connector_messages.get_mut(&(message_id, meta_data_id)) {
            Some(mut row) => {
                row.status = status;
                row.send_attempts = send_attempts;
                if send_date.is_some() {
                    row.send_date = send_date;
                }
                if response_date.is_some() {
                    row.response_date = response_date;
                }
                if let Some(err) = processing_error {
                    row.processing_error = Some(err.to_string());
                }
                Ok(())
            }
            None => Err(StoreError::Integrity(format!(
                "connector message ({}, {}) not found",
                message_id, meta_data_id
            ))
            .into()),
        }
    }

    async fn connector_message_status(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
    ) -> Result<Option<Status>> {
        let tables = self.tables(channel_id)?;
        Ok(tables
            .connector_messages
            .get(&(message_id, meta_data_id))
            .map(|r| r.status))
    }

    async fn store_content(&self, channel_id: &str, content: &MessageContent) -> Result<()> {
        let tables = self.tables(channel_id)?;
        let mut stored = content.clone();
        if self.encryptor.is_enabled() {
            stored.content = self.encryptor.encrypt(&content.content)?;
            stored.encrypted = true;
        }
        tables.content.insert(
            (
                content.message_id,
                content.meta_data_id,
                content.content_type.code(),
            ),
            stored,
        );
        Ok(())
    }

    async fn load_content(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
        content_type: ContentType,
    ) -> Result<Option<MessageContent>> {
        let tables = self.tables(channel_id)?;
        let Some(row) = tables
            .content
            .get(&(message_id, meta_data_id, content_type.code()))
        else {
            return Ok(None);
        };
        let mut content = row.clone();
        drop(row);
        if content.encrypted {
            content.content = self.encryptor.decrypt(&content.content)?;
            content.encrypted = false;
        }
        Ok(Some(content))
    }

    async fn store_metadata_values(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
        values: &HashMap<String, MetadataValue>,
    ) -> Result<()> {
        let tables = self.tables(channel_id)?;
        let declared: Vec<String> = tables
            .metadata_columns
            .read()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let mut accepted = HashMap::new();
        for (name, value) in values {
            let lowered = name.to_lowercase();
            if declared.iter().any(|c| *c == lowered) {
                accepted.insert(lowered, value.clone());
            } else {
                debug!(channel_id, column = %name, "dropping value for undeclared metadata column");
            }
        }
        if !accepted.is_empty() {
            tables
                .metadata_values
                .insert((message_id, meta_data_id), accepted);
        }
        Ok(())
    }

    async fn insert_attachment(&self, channel_id: &str, attachment: &Attachment) -> Result<()> {
        let tables = self.tables(channel_id)?;
        tables.attachments.insert(
            (attachment.message_id, attachment.id.clone()),
            attachment.clone(),
        );
        Ok(())
    }

    async fn load_attachment(
        &self,
        channel_id: &str,
        message_id: i64,
        attachment_id: &str,
    ) -> Result<Option<Attachment>> {
        let tables = self.tables(channel_id)?;
        Ok(tables
            .attachments
            .get(&(message_id, attachment_id.to_string()))
            .map(|a| a.clone()))
    }

    async fn queued_entries(
        &self,
        channel_id: &str,
        meta_data_id: i32,
        limit: i64,
    ) -> Result<Vec<QueueEntry>> {
        let tables = self.tables(channel_id)?;
        let mut entries: Vec<QueueEntry> = tables
            .connector_messages
            .iter()
            .filter(|e| e.key().1 == meta_data_id && e.value().status == Status::Queued)
            .map(|e| QueueEntry {
                message_id: e.key().0,
                attempts: e.value().send_attempts,
            })
            .collect();
        entries.sort_by_key(|e| e.message_id);
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn register_server(&self, info: &ServerInfo) -> Result<()> {
        self.servers.insert(info.server_id.clone(), info.clone());
        Ok(())
    }

    async fn heartbeat(&self, server_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut server) = self.servers.get_mut(server_id) {
            server.last_heartbeat = at;
        }
        Ok(())
    }

    async fn record_deployment(&self, server_id: &str, channel_id: &str) -> Result<()> {
        self.deployments
            .insert((server_id.to_string(), channel_id.to_string()), Utc::now());
        Ok(())
    }

    async fn remove_deployment(&self, server_id: &str, channel_id: &str) -> Result<()> {
        self.deployments
            .remove(&(server_id.to_string(), channel_id.to_string()));
        Ok(())
    }

    async fn audit_event(
        &self,
        name: &str,
        level: &str,
        outcome: &str,
        attributes: &str,
        server_id: &str,
    ) -> Result<()> {
        self.audit_log.lock().push((
            name.to_string(),
            level.to_string(),
            outcome.to_string(),
            attributes.to_string(),
            server_id.to_string(),
            Utc::now(),
        ));
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for InMemoryStore {
    async fn advance_block(&self, channel_id: &str, block_size: i64) -> Result<i64> {
        let mut entry = self
            .sequences
            .entry(channel_id.to_string())
            .or_insert(1);
        let first = *entry;
        *entry += block_size;
        Ok(first)
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn try_acquire(&self, channel_id: &str, server_id: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Driver(format!("lease ttl out of range: {}", e)))?;
        match self.leases.entry(channel_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let lease = occupied.get_mut();
                if lease.server_id == server_id || lease.expires_at < now {
                    if lease.server_id != server_id {
                        lease.acquired_at = now;
                    }
                    lease.server_id = server_id.to_string();
                    lease.renewed_at = now;
                    lease.expires_at = now + ttl;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Lease {
                    channel_id: channel_id.to_string(),
                    server_id: server_id.to_string(),
                    acquired_at: now,
                    renewed_at: now,
                    expires_at: now + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn renew(&self, channel_id: &str, server_id: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Driver(format!("lease ttl out of range: {}", e)))?;
        match self.leases.get_mut(channel_id) {
            Some(mut lease) if lease.server_id == server_id && lease.expires_at >= now => {
                lease.renewed_at = now;
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, channel_id: &str, server_id: &str) -> Result<()> {
        self.leases
            .remove_if(channel_id, |_, lease| lease.server_id == server_id);
        Ok(())
    }

    async fn current_lease(&self, channel_id: &str) -> Result<Option<Lease>> {
        Ok(self.leases.get(channel_id).map(|l| l.clone()))
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn append_cluster_event(
        &self,
        channel: &str,
        data: &str,
        server_id: &str,
    ) -> Result<i64> {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        self.cluster_events.lock().push(ClusterEventRow {
            id,
            channel: channel.to_string(),
            data: data.to_string(),
            created_at: Utc::now(),
            server_id: server_id.to_string(),
        });
        Ok(id)
    }

    async fn cluster_events_after(
        &self,
        last_seen: i64,
        exclude_server: &str,
    ) -> Result<Vec<ClusterEventRow>> {
        Ok(self
            .cluster_events
            .lock()
            .iter()
            .filter(|e| e.id > last_seen && e.server_id != exclude_server)
            .cloned()
            .collect())
    }

    async fn latest_cluster_event_id(&self) -> Result<i64> {
        Ok(self.next_event_id.load(Ordering::SeqCst) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::encryption::AesContentEncryptor;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn content_round_trips_through_encryption() {
        let store =
            InMemoryStore::with_encryptor(Arc::new(AesContentEncryptor::from_passphrase("k")));
        store.create_channel_tables("chan1").await.unwrap();

        let content = MessageContent::new(1, 0, ContentType::Raw, "MSH|^~\\&|...")
            .with_data_type("HL7V2");
        store.store_content("chan1", &content).await.unwrap();

        let loaded = store
            .load_content("chan1", 1, 0, ContentType::Raw)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.content, "MSH|^~\\&|...");
        assert!(!loaded.encrypted);
        assert_eq!(loaded.data_type.as_deref(), Some("HL7V2"));
    }

    #[tokio::test]
    async fn duplicate_message_insert_is_an_integrity_error() {
        let store = InMemoryStore::new();
        store.create_channel_tables("c").await.unwrap();
        let message = Message::new(1, "c", "s1");
        store.insert_message(&message).await.unwrap();
        let err = store.insert_message(&message).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::Store(StoreError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn queued_entries_come_back_in_message_order() {
        let store = InMemoryStore::new();
        store.create_channel_tables("c").await.unwrap();
        for id in [5i64, 2, 9] {
            let mut cm = ConnectorMessage::new(id, 1, "c", "dest", "s1", Status::Queued);
            cm.send_attempts = 1;
            store.insert_connector_message(&cm).await.unwrap();
        }
        // a sent row must not be recovered
        let cm = ConnectorMessage::new(7, 1, "c", "dest", "s1", Status::Sent);
        store.insert_connector_message(&cm).await.unwrap();

        let entries = store.queued_entries("c", 1, 100).await.unwrap();
        let ids: Vec<i64> = entries.iter().map(|e| e.message_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert!(entries.iter().all(|e| e.attempts == 1));
    }

    #[tokio::test]
    async fn lease_steal_requires_expiry() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(30);
        assert!(store.try_acquire("c", "node-a", ttl).await.unwrap());
        assert!(!store.try_acquire("c", "node-b", ttl).await.unwrap());
        // holder can re-take its own lease
        assert!(store.try_acquire("c", "node-a", ttl).await.unwrap());

        // expired lease is stealable
        let short = Duration::from_millis(1);
        assert!(store.try_acquire("c2", "node-a", short).await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.try_acquire("c2", "node-b", ttl).await.unwrap());
        assert_eq!(
            store.current_lease("c2").await.unwrap().unwrap().server_id,
            "node-b"
        );
    }

    #[tokio::test]
    async fn metadata_sync_replaces_column_set() {
        let store = InMemoryStore::new();
        store.create_channel_tables("c").await.unwrap();
        let first = vec![
            MetadataColumn {
                name: "A".into(),
                column_type: crate::model::MetadataColumnType::String,
                mapping: None,
            },
            MetadataColumn {
                name: "B".into(),
                column_type: crate::model::MetadataColumnType::Number,
                mapping: None,
            },
        ];
        store.sync_metadata_columns("c", &first).await.unwrap();
        assert_eq!(
            store.metadata_column_names("c").await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );

        let second = vec![
            MetadataColumn {
                name: "B".into(),
                column_type: crate::model::MetadataColumnType::Number,
                mapping: None,
            },
            MetadataColumn {
                name: "C".into(),
                column_type: crate::model::MetadataColumnType::Boolean,
                mapping: None,
            },
        ];
        store.sync_metadata_columns("c", &second).await.unwrap();
        assert_eq!(
            store.metadata_column_names("c").await.unwrap(),
            vec!["b".to_string(), "c".to_string()]
        );
    }
}
