//! Cluster coordination primitives
//!
//! Everything multi-node sits here: the exclusive polling lease that keeps
//! one poller per channel across the cluster, the pub/sub event bus with its
//! three substitutable backends, and the shared key/value map backends with
//! optimistic concurrency.

pub mod events;
pub mod lease;
pub mod map;

pub use events::{
    DbPollingEventBus, EngineEvent, EventBus, EventEnvelope, LocalEventBus, RedisEventBus,
};
pub use lease::{LeaseHandle, PollingLeaseManager};
pub use map::{DatabaseMapBackend, InMemoryMapBackend, MapBackend, RedisMapBackend};

/// Scope name for the process-wide global map
pub const GLOBAL_SCOPE: &str = "global";

/// Scope name for one channel's global channel map
pub fn channel_scope(channel_id: &str) -> String {
    format!("gcm:{}", channel_id)
}

/// Scope name for the configuration map
pub const CONFIGURATION_SCOPE: &str = "configuration";
