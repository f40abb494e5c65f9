//! Core message and channel model shared by the pipeline, store and queue

pub mod channel;
pub mod message;
pub mod status;

pub use channel::{
    ChannelConfig, DestinationConfig, DestinationKind, FileReaderSettings, FileWriterSettings,
    MetadataColumn, MetadataColumnType, QueuePolicy, QueueSettings, SourceConfig, SourceKind,
};
pub use message::{
    Attachment, ConnectorMessage, Message, MessageContent, MetadataValue, RawMessage, Response,
};
pub use status::{ContentType, Status};
