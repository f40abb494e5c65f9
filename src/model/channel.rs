//! Channel configuration model
//!
//! A channel is the user-defined integration unit: one source connector, an
//! ordered list of destination connectors, scripts, data type assignments and
//! custom metadata columns. The engine validates a `ChannelConfig` at deploy
//! time and the store derives the per-channel tables from it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete configuration of one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Stable opaque identifier; also the seed for per-channel table names
    pub id: String,
    pub name: String,
    pub revision: i32,
    pub enabled: bool,
    pub source: SourceConfig,
    /// Ordered; metadata id is 1 + position unless set explicitly
    pub destinations: Vec<DestinationConfig>,
    /// Runs before the source filter/transformer; may replace the raw text
    pub preprocessor: Option<String>,
    /// Runs after the last destination returns or enqueues
    pub postprocessor: Option<String>,
    pub deploy_script: Option<String>,
    pub undeploy_script: Option<String>,
    pub metadata_columns: Vec<MetadataColumn>,
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source: SourceConfig) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            revision: 1,
            enabled: true,
            source,
            destinations: Vec::new(),
            preprocessor: None,
            postprocessor: None,
            deploy_script: None,
            undeploy_script: None,
            metadata_columns: Vec::new(),
        }
    }

    pub fn add_destination(mut self, destination: DestinationConfig) -> Self {
        self.destinations.push(destination);
        self
    }
}

/// Source connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Data type the raw content is parsed with
    pub data_type: String,
    pub filter: Option<String>,
    pub transformer: Option<String>,
    /// When true, the source's caller blocks until the pipeline finishes and
    /// receives the postprocessor/destination response
    pub respond_after_processing: bool,
}

impl SourceConfig {
    pub fn channel_reader() -> Self {
        Self {
            kind: SourceKind::ChannelReader,
            data_type: "RAW".to_string(),
            filter: None,
            transformer: None,
            respond_after_processing: true,
        }
    }

    pub fn file_reader(settings: FileReaderSettings) -> Self {
        Self {
            kind: SourceKind::FileReader(settings),
            data_type: "RAW".to_string(),
            filter: None,
            transformer: None,
            respond_after_processing: true,
        }
    }
}

/// The fixed set of source connector kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SourceKind {
    /// Event-driven: messages arrive via the engine's dispatch endpoint
    /// (channel-to-channel writers and external callers)
    ChannelReader,
    /// Poll-driven directory reader; requires the polling lease in a cluster
    FileReader(FileReaderSettings),
}

impl SourceKind {
    /// Poll-driven sources are gated by the cluster polling lease
    pub fn is_polling(&self) -> bool {
        matches!(self, SourceKind::FileReader(_))
    }
}

/// File reader source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReaderSettings {
    pub input_dir: String,
    /// Only files ending with this suffix are picked up; empty = all files
    #[serde(default)]
    pub suffix: String,
    /// Where consumed files are moved; None deletes them after hand-off
    pub move_to_dir: Option<String>,
    /// Files that fail hand-off are moved here instead of being retried
    pub error_dir: Option<String>,
    #[serde(with = "duration_millis", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(1000)
}

impl Default for FileReaderSettings {
    fn default() -> Self {
        Self {
            input_dir: String::new(),
            suffix: String::new(),
            move_to_dir: None,
            error_dir: None,
            poll_interval: default_poll_interval(),
        }
    }
}

/// Destination connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Unique within the channel, >= 1; 0 is reserved for the source
    pub meta_data_id: i32,
    pub name: String,
    pub kind: DestinationKind,
    pub data_type: String,
    pub filter: Option<String>,
    pub transformer: Option<String>,
    pub response_transformer: Option<String>,
    /// Do not start until the previous destination reached a terminal status
    pub wait_for_previous: bool,
    pub queue: QueueSettings,
}

impl DestinationConfig {
    pub fn new(meta_data_id: i32, name: impl Into<String>, kind: DestinationKind) -> Self {
        Self {
            meta_data_id,
            name: name.into(),
            kind,
            data_type: "RAW".to_string(),
            filter: None,
            transformer: None,
            response_transformer: None,
            wait_for_previous: true,
            queue: QueueSettings::default(),
        }
    }
}

/// The fixed set of destination connector kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DestinationKind {
    /// Write the encoded payload to a file
    FileWriter(FileWriterSettings),
    /// Deliver to another channel, resolved by id through the engine registry
    ChannelWriter {
        target_channel_id: String,
    },
    /// Evaluate a user script; its return value becomes the response
    Script {
        script: String,
    },
    /// Dispatch through a named transport registered with the engine
    Transport {
        transport: String,
        target: String,
    },
}

/// File writer destination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWriterSettings {
    pub output_dir: String,
    /// Filename template; `${message_id}` is substituted
    pub file_name: String,
    #[serde(default)]
    pub append: bool,
}

/// Destination queue and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// When false the pipeline dispatches synchronously on the source thread
    pub enabled: bool,
    /// Dispatch immediately on the enqueueing thread when the queue is empty
    pub send_first: bool,
    /// Retries after the first attempt; total attempts = retry_count + 1
    pub retry_count: u32,
    #[serde(with = "duration_millis", default = "default_retry_interval")]
    pub retry_interval: Duration,
    pub policy: QueuePolicy,
    /// Bounded concurrency; ordering guarantees are per-slot when > 1
    pub threads: usize,
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(10_000)
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            send_first: false,
            retry_count: 0,
            retry_interval: default_retry_interval(),
            policy: QueuePolicy::StrictOrder,
            threads: 1,
        }
    }
}

/// What the queue does with the head entry after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuePolicy {
    /// Head stays at head; retried until success or retries exhausted
    StrictOrder,
    /// Head moves to the tail so later messages get attempted
    RotateOnError,
}

/// A user-declared custom metadata column on the `MCM` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataColumn {
    pub name: String,
    pub column_type: MetadataColumnType,
    /// Channel/source map key the value is pulled from after the transformer
    pub mapping: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataColumnType {
    String,
    Number,
    Boolean,
    Timestamp,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_config_round_trips_through_json() {
        let config = ChannelConfig::new("a1b2", "ADT Inbound", SourceConfig::channel_reader())
            .add_destination(DestinationConfig::new(
                1,
                "To EHR",
                DestinationKind::FileWriter(FileWriterSettings {
                    output_dir: "/var/out".into(),
                    file_name: "${message_id}.hl7".into(),
                    append: false,
                }),
            ));
        let json = serde_json::to_string(&config).unwrap();
        let back: ChannelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "a1b2");
        assert_eq!(back.destinations.len(), 1);
        assert_eq!(back.destinations[0].meta_data_id, 1);
    }
}
