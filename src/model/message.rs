//! Message, connector message, content and attachment types

use super::status::{ContentType, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A raw message handed to a channel by its source connector
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    /// Raw content as received on the wire
    pub content: String,
    /// Read-only facts about the receive event (filename, remote address, ...)
    pub source_map: HashMap<String, Value>,
    /// Attachments already separated from the content by the caller
    pub attachments: Vec<Attachment>,
}

impl RawMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source_map: HashMap::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_source_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.source_map.insert(key.into(), value);
        self
    }
}

/// One message within a channel; owns the source connector message and one
/// connector message per destination
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: i64,
    pub channel_id: String,
    pub server_id: String,
    pub received_date: DateTime<Utc>,
    pub processed: bool,
    /// Id of the message this one was reprocessed from
    pub original_id: Option<i64>,
    /// Set when the message was imported rather than received
    pub import_id: Option<i64>,
    pub import_channel_id: Option<String>,
    /// Keyed by metadata id; 0 is the source
    pub connector_messages: BTreeMap<i32, ConnectorMessage>,
}

impl Message {
    pub fn new(message_id: i64, channel_id: &str, server_id: &str) -> Self {
        Self {
            message_id,
            channel_id: channel_id.to_string(),
            server_id: server_id.to_string(),
            received_date: Utc::now(),
            processed: false,
            original_id: None,
            import_id: None,
            import_channel_id: None,
            connector_messages: BTreeMap::new(),
        }
    }

    pub fn source(&self) -> Option<&ConnectorMessage> {
        self.connector_messages.get(&0)
    }
}

/// A message's state within one connector (source or destination)
#[derive(Debug, Clone)]
pub struct ConnectorMessage {
    pub message_id: i64,
    /// 0 for the source connector, >= 1 for destinations
    pub meta_data_id: i32,
    pub channel_id: String,
    pub connector_name: String,
    pub server_id: String,
    pub received_date: DateTime<Utc>,
    pub status: Status,
    pub send_attempts: u32,
    pub send_date: Option<DateTime<Utc>>,
    pub response_date: Option<DateTime<Utc>>,
    pub error_code: i32,
    /// Destinations sharing a chain run sequentially; chains run concurrently
    pub chain_id: i32,
    /// Position within the chain
    pub order_id: i32,
    pub processing_error: Option<String>,

    /// Read-only facts from the receive event, shared across the message
    pub source_map: Arc<HashMap<String, Value>>,
    /// Channel-scoped variables, visible to every later step of this message
    pub channel_map: HashMap<String, Value>,
    /// Connector-scoped variables, private to this connector message
    pub connector_map: HashMap<String, Value>,
    /// Destination responses keyed by destination name and `d{metaDataId}`
    pub response_map: HashMap<String, Value>,
    /// Values destined for the custom metadata columns
    pub metadata_values: HashMap<String, MetadataValue>,
}

impl ConnectorMessage {
    pub fn new(
        message_id: i64,
        meta_data_id: i32,
        channel_id: &str,
        connector_name: &str,
        server_id: &str,
        status: Status,
    ) -> Self {
        Self {
            message_id,
            meta_data_id,
            channel_id: channel_id.to_string(),
            connector_name: connector_name.to_string(),
            server_id: server_id.to_string(),
            received_date: Utc::now(),
            status,
            send_attempts: 0,
            send_date: None,
            response_date: None,
            error_code: 0,
            chain_id: 0,
            order_id: 0,
            processing_error: None,
            source_map: Arc::new(HashMap::new()),
            channel_map: HashMap::new(),
            connector_map: HashMap::new(),
            response_map: HashMap::new(),
            metadata_values: HashMap::new(),
        }
    }

    /// Channel map lookup with read-through to the source map. The fallback
    /// is part of the map contract scripts rely on; it is logged at debug
    /// level so misuse can be traced without flooding production logs.
    pub fn channel_value(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.channel_map.get(key) {
            return Some(v);
        }
        let fallback = self.source_map.get(key);
        if fallback.is_some() {
            tracing::debug!(key, "channel map read fell back to source map");
        }
        fallback
    }
}

/// One serialized form of a connector message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    pub message_id: i64,
    pub meta_data_id: i32,
    pub content_type: ContentType,
    pub content: String,
    /// Data type name the content is serialized with (RAW, JSON, HL7V2, ...)
    pub data_type: Option<String>,
    /// Whether the stored row is encrypted at rest
    pub encrypted: bool,
}

impl MessageContent {
    pub fn new(
        message_id: i64,
        meta_data_id: i32,
        content_type: ContentType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            meta_data_id,
            content_type,
            content: content.into(),
            data_type: None,
            encrypted: false,
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }
}

/// Opaque binary attachment referenced from message content via
/// `${ATTACH:id}` tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Content-addressable identifier (hex SHA-256 of the payload)
    pub id: String,
    pub message_id: i64,
    pub mime_type: String,
    pub content: Vec<u8>,
}

impl Attachment {
    /// Build an attachment with its content-addressed id
    pub fn from_content(message_id: i64, mime_type: &str, content: Vec<u8>) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(&content);
        let id = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self {
            id,
            message_id,
            mime_type: mime_type.to_string(),
            content,
        }
    }

    /// The token form substituted into message content
    pub fn token(&self) -> String {
        format!("${{ATTACH:{}}}", self.id)
    }
}

/// A value bound for a user-declared metadata column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

/// Result of a destination dispatch, as reported by its transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    /// Response body (acknowledgement payload)
    pub message: String,
    pub status_message: Option<String>,
    pub error: Option<String>,
}

impl Response {
    pub fn sent(message: impl Into<String>) -> Self {
        Self {
            status: Status::Sent,
            message: message.into(),
            status_message: None,
            error: None,
        }
    }

    pub fn queued(status_message: impl Into<String>) -> Self {
        Self {
            status: Status::Queued,
            message: String::new(),
            status_message: Some(status_message.into()),
            error: None,
        }
    }

    pub fn error(status_message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: String::new(),
            status_message: Some(status_message.into()),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_value_falls_back_to_source_map() {
        let mut cm =
            ConnectorMessage::new(1, 0, "chan", "Source", "server-1", Status::Received);
        let mut source = HashMap::new();
        source.insert("originalFilename".to_string(), json!("a.hl7"));
        cm.source_map = Arc::new(source);
        cm.channel_map.insert("mrn".to_string(), json!("12345"));

        assert_eq!(cm.channel_value("mrn"), Some(&json!("12345")));
        assert_eq!(cm.channel_value("originalFilename"), Some(&json!("a.hl7")));
        assert_eq!(cm.channel_value("missing"), None);
    }

    #[test]
    fn attachment_id_is_content_addressed() {
        let a = Attachment::from_content(7, "application/pdf", vec![1, 2, 3]);
        let b = Attachment::from_content(8, "application/pdf", vec![1, 2, 3]);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);
        assert!(a.token().starts_with("${ATTACH:"));
    }
}
