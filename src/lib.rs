//! # Meridian: Clinical Data Integration Engine
//!
//! **A channel-based integration engine for health-care data: protocol
//! sources in, per-channel processing pipelines, durable queued delivery
//! out — on one node or a shared-store cluster.**
//!
//! ## What Meridian Does
//!
//! Meridian moves clinical messages (HL7 v2, JSON, XML, EDI/X12, NCPDP,
//! delimited feeds) between systems that were never designed to talk to
//! each other:
//!
//! - **Channels**: each channel is one source connector, an ordered list of
//!   destination connectors, filter/transformer scripts and data type
//!   assignments
//! - **Durable pipeline**: every message, status transition and content
//!   form is persisted to per-channel tables, optionally encrypted at rest
//! - **Queued delivery**: per-destination FIFO queues with bounded retry,
//!   strict-order or rotate-on-error policies, and a send-first fast path
//! - **Clustering**: nodes share a PostgreSQL store; polling leases keep
//!   one poller per channel, an event bus fans out state changes, and
//!   shared maps replicate script state
//!
//! ## Architecture
//!
//! ```text
//! source connector ──► pipeline ──► destination chains ──► connectors
//!      (lease-gated)      │               │  (sync or queued)
//!                         ▼               ▼
//!                    message store   destination queues
//!                    (per-channel    (durable, retrying)
//!                     tables)
//! ```
//!
//! Layered bottom-up: the [`store`] owns all persisted state behind one DAO
//! trait family; [`cluster`] adds leases, the event bus and shared map
//! backends; [`pipeline`] drives messages through scripts and destinations;
//! [`engine`] owns channel lifecycle, from deploy to halt, including shadow
//! mode for observed cutovers.
//!
//! ## Quick Start
//!
//! ```no_run
//! use meridian::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::for_testing();
//!
//!     let store = Arc::new(InMemoryStore::new());
//!     let maps = Arc::new(GlobalMaps::new(Arc::new(InMemoryMapBackend::new())));
//!     let bus = Arc::new(LocalEventBus::new(config.server_id()));
//!     let engine = Engine::new(config, store, bus, maps, Arc::new(PassthroughScriptEngine));
//!     engine.start().await?;
//!
//!     // a channel that accepts messages and writes them to disk
//!     let channel = ChannelConfig::new("adt1", "ADT Inbound", SourceConfig::channel_reader())
//!         .add_destination(DestinationConfig::new(
//!             1,
//!             "To Archive",
//!             DestinationKind::FileWriter(FileWriterSettings {
//!                 output_dir: "/var/meridian/out".into(),
//!                 file_name: "${message_id}.hl7".into(),
//!                 append: false,
//!             }),
//!         ));
//!     engine.deploy(channel).await?;
//!     engine.start_channel("adt1").await?;
//!
//!     let outcome = engine
//!         .dispatch_raw_message("adt1", RawMessage::new("MSH|^~\\&|..."))
//!         .await?;
//!     println!("stored as message {}", outcome.message_id);
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod connector;
pub mod datatype;
pub mod engine;
pub mod error;
pub mod maps;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod script;
pub mod store;

pub use cluster::{
    DatabaseMapBackend, DbPollingEventBus, EngineEvent, EventBus, EventEnvelope,
    InMemoryMapBackend, LocalEventBus, MapBackend, PollingLeaseManager, RedisEventBus,
    RedisMapBackend,
};
pub use config::{Config, EventBusKind, MapBackendKind, StoreBackendKind};
pub use connector::{
    ChannelResolver, DestinationConnector, DispatchTransport, FileReaderSource,
    FileWriterDestination, MessageReceiver, ReceiveOutcome, ScriptDestination, SourceConnector,
    SourceContext, TransportDestination,
};
pub use datatype::{DataType, DataTypeRegistry, DelimitedDataType, JsonDataType, RawDataType};
pub use engine::{ChannelSignal, ChannelState, Engine};
pub use error::{EngineError, Result, StoreError};
pub use maps::{GlobalMaps, SharedMap};
pub use model::{
    Attachment, ChannelConfig, ConnectorMessage, ContentType, DestinationConfig, DestinationKind,
    FileReaderSettings, FileWriterSettings, Message, MessageContent, MetadataColumn,
    MetadataColumnType, MetadataValue, QueuePolicy, QueueSettings, RawMessage, Response,
    SourceConfig, SourceKind, Status,
};
pub use pipeline::{ChannelPipeline, DestinationDispatcher, DestinationRuntime, DispatchOutcome};
pub use queue::DestinationQueue;
pub use script::{PassthroughScriptEngine, ScriptEngine, ScriptOutcome, ScriptScope};
pub use store::{
    AesContentEncryptor, ClusterEventRow, ClusterStore, ContentEncryptor, EventStore,
    InMemoryStore, Lease, LeaseStore, MessageStore, NoopEncryptor, QueueEntry, SequenceAllocator,
    SequenceStore, ServerInfo, SqlStore, Store,
};

/// Crate version, surfaced in server registration and logs
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
