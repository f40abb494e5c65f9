//! Engine: channel lifecycle controller
//!
//! Owns the in-process channel registry and drives each channel through
//! `Undeployed -> Deployed -> Started -> [Paused | Stopping -> Deployed] ->
//! Halted`. Deploy validates the configuration, installs the per-channel
//! schema and registers the runtime; start wires the source connector,
//! polling lease and destination queues; stop waits out a grace period and
//! then escalates to halt. Shadow mode gates unpromoted sources so a
//! standby node can hold deployed channels silently until cutover.

use crate::cluster::{EngineEvent, EventBus, LeaseHandle, PollingLeaseManager};
use crate::config::Config;
use crate::connector::{
    ChannelResolver, ChannelWriterDestination, DestinationConnector, DispatchTransport,
    FileReaderSource, FileWriterDestination, MessageReceiver, ReceiveOutcome, ScriptDestination,
    SourceConnector, SourceContext, TransportDestination,
};
use crate::datatype::DataTypeRegistry;
use crate::error::{EngineError, Result};
use crate::maps::GlobalMaps;
use crate::model::{
    ChannelConfig, DestinationKind, RawMessage, Response, SourceKind,
};
use crate::pipeline::{ChannelPipeline, DestinationDispatcher, DestinationRuntime};
use crate::queue::DestinationQueue;
use crate::script::{ScriptEngine, ScriptScope, with_timeout};
use crate::store::{ClusterStore, MessageStore, SequenceAllocator, ServerInfo, Store};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Control signal fanned out to a channel's tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSignal {
    Run,
    /// Finish the current unit of work, then exit
    Stop,
    /// Abandon in-flight work; interrupted sends become errors
    Halt,
}

/// Lifecycle state of a deployed channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Deployed,
    Started,
    Paused,
    Stopping,
    Halted,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelState::Deployed => "DEPLOYED",
            ChannelState::Started => "STARTED",
            ChannelState::Paused => "PAUSED",
            ChannelState::Stopping => "STOPPING",
            ChannelState::Halted => "HALTED",
        };
        write!(f, "{}", name)
    }
}

struct DeployedChannel {
    config: ChannelConfig,
    pipeline: Arc<ChannelPipeline>,
    state: RwLock<ChannelState>,
    /// Queue workers and halt propagation
    signal: watch::Sender<ChannelSignal>,
    /// Source task control, separate so pause leaves the queues running
    source_signal: watch::Sender<ChannelSignal>,
    source: Option<Arc<dyn SourceConnector>>,
    source_running: AtomicBool,
    lease_shutdown: SyncMutex<Option<watch::Sender<bool>>>,
    lease: SyncMutex<Option<Arc<LeaseHandle>>>,
}

/// The engine: deploys channels, runs them, coordinates with the cluster
pub struct Engine {
    config: Config,
    server_id: String,
    store: Arc<dyn Store>,
    sequencer: Arc<SequenceAllocator>,
    script_engine: Arc<dyn ScriptEngine>,
    data_types: Arc<DataTypeRegistry>,
    maps: Arc<GlobalMaps>,
    event_bus: Arc<dyn EventBus>,
    lease_manager: Arc<PollingLeaseManager>,
    transports: DashMap<String, Arc<dyn DispatchTransport>>,
    channels: DashMap<String, Arc<DeployedChannel>>,
    shadow_enabled: AtomicBool,
    promoted: DashSet<String>,
    background_shutdown: watch::Sender<bool>,
    background: SyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        event_bus: Arc<dyn EventBus>,
        maps: Arc<GlobalMaps>,
        script_engine: Arc<dyn ScriptEngine>,
    ) -> Arc<Self> {
        let server_id = config.server_id();
        let sequencer = Arc::new(SequenceAllocator::new(
            store.clone(),
            config.engine.sequence_block_size,
        ));
        let lease_manager = Arc::new(PollingLeaseManager::new(
            store.clone(),
            server_id.clone(),
            config.lease_ttl(),
        ));
        let (background_shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            server_id,
            store,
            sequencer,
            script_engine,
            data_types: Arc::new(DataTypeRegistry::with_defaults()),
            maps,
            event_bus,
            lease_manager,
            transports: DashMap::new(),
            channels: DashMap::new(),
            shadow_enabled: AtomicBool::new(false),
            promoted: DashSet::new(),
            background_shutdown,
            background: SyncMutex::new(Vec::new()),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn data_types(&self) -> &Arc<DataTypeRegistry> {
        &self.data_types
    }

    pub fn maps(&self) -> &Arc<GlobalMaps> {
        &self.maps
    }

    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.event_bus
    }

    /// Register a named dispatch transport for `DestinationKind::Transport`
    pub fn register_transport(&self, name: impl Into<String>, transport: Arc<dyn DispatchTransport>) {
        self.transports.insert(name.into(), transport);
    }

    /// One-time node startup: schema, registration, cluster substrate
    pub async fn start(&self) -> Result<()> {
        self.store.ensure_core_tables().await?;
        let now = Utc::now();
        self.store
            .register_server(&ServerInfo {
                server_id: self.server_id.clone(),
                hostname: self.config.server.hostname.clone(),
                port: self.config.server.port.map(|p| p as i32),
                api_url: None,
                started_at: now,
                last_heartbeat: now,
                status: "ONLINE".to_string(),
            })
            .await?;
        self.event_bus.start().await?;
        self.maps.load().await?;

        let mut background = self.background.lock();
        background.push(self.spawn_heartbeat());
        background.push(self.maps.spawn_configuration_refresh(
            self.config.configuration_map_refresh(),
            self.background_shutdown.subscribe(),
        ));
        info!(server_id = %self.server_id, "engine started");
        Ok(())
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let server_id = self.server_id.clone();
        let interval = self.config.heartbeat_interval();
        let mut shutdown = self.background_shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if let Err(e) = store.heartbeat(&server_id, Utc::now()).await {
                    warn!(error = %e, "server heartbeat failed");
                }
            }
        })
    }

    /// Node shutdown: stop every channel, then the substrate
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        let ids: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        for id in ids {
            let state = self.channel_state(&id);
            if matches!(state, Some(ChannelState::Started) | Some(ChannelState::Paused)) {
                if let Err(e) = self.stop_channel(&id).await {
                    error!(channel_id = %id, error = %e, "channel stop failed during shutdown");
                }
            }
        }
        let _ = self.background_shutdown.send(true);
        let tasks: Vec<_> = self.background.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.event_bus.stop().await;
        let _ = self
            .store
            .register_server(&ServerInfo {
                server_id: self.server_id.clone(),
                hostname: self.config.server.hostname.clone(),
                port: self.config.server.port.map(|p| p as i32),
                api_url: None,
                started_at: Utc::now(),
                last_heartbeat: Utc::now(),
                status: "OFFLINE".to_string(),
            })
            .await;
        info!(server_id = %self.server_id, "engine stopped");
        Ok(())
    }

    // -- deployment ---------------------------------------------------------

    pub async fn deploy(self: &Arc<Self>, config: ChannelConfig) -> Result<()> {
        self.validate_channel(&config)?;
        if !config.enabled {
            return Err(EngineError::Configuration(format!(
                "channel {} is disabled",
                config.id
            )));
        }
        if self.channels.contains_key(&config.id) {
            return Err(EngineError::Configuration(format!(
                "channel {} is already deployed; undeploy it first",
                config.id
            )));
        }

        self.store.create_channel_tables(&config.id).await?;
        self.store
            .sync_metadata_columns(&config.id, &config.metadata_columns)
            .await?;
        self.store.upsert_channel(&config).await?;

        let (signal, _) = watch::channel(ChannelSignal::Stop);
        let (source_signal, _) = watch::channel(ChannelSignal::Stop);

        let mut destinations = Vec::with_capacity(config.destinations.len());
        for dest in &config.destinations {
            let connector = self.build_destination_connector(dest)?;
            let dispatcher = Arc::new(DestinationDispatcher::new(
                config.id.clone(),
                self.server_id.clone(),
                dest.clone(),
                connector,
                self.store.clone(),
                self.script_engine.clone(),
                self.config.script_timeout(),
            ));
            let queue = if dest.queue.enabled {
                Some(DestinationQueue::new(
                    config.id.clone(),
                    dest.queue.clone(),
                    self.store.clone(),
                    dispatcher.clone(),
                    signal.subscribe(),
                ))
            } else {
                None
            };
            destinations.push(DestinationRuntime { dispatcher, queue });
        }

        let source = self.build_source_connector(&config)?;
        let pipeline = Arc::new(ChannelPipeline::new(
            config.clone(),
            self.store.clone(),
            self.sequencer.clone(),
            self.script_engine.clone(),
            self.data_types.clone(),
            self.maps.clone(),
            self.event_bus.clone(),
            self.server_id.clone(),
            self.config.script_timeout(),
            destinations,
        ));
        pipeline.set_shadow_gated(
            self.shadow_enabled.load(Ordering::SeqCst) && !self.promoted.contains(&config.id),
        );

        if let Some(script) = &config.deploy_script {
            let mut scope = ScriptScope {
                channel_id: config.id.clone(),
                channel_name: config.name.clone(),
                ..Default::default()
            };
            with_timeout(
                self.config.script_timeout(),
                "deploy script",
                self.script_engine.run_lifecycle_script(script, &mut scope),
            )
            .await?;
        }

        let channel = Arc::new(DeployedChannel {
            config: config.clone(),
            pipeline,
            state: RwLock::new(ChannelState::Deployed),
            signal,
            source_signal,
            source,
            source_running: AtomicBool::new(false),
            lease_shutdown: SyncMutex::new(None),
            lease: SyncMutex::new(None),
        });
        self.channels.insert(config.id.clone(), channel);

        self.store
            .record_deployment(&self.server_id, &config.id)
            .await?;
        self.store
            .audit_event(
                "channel.deploy",
                "INFO",
                "SUCCESS",
                &format!("{{\"channelId\":\"{}\",\"revision\":{}}}", config.id, config.revision),
                &self.server_id,
            )
            .await?;
        self.publish(EngineEvent::ChannelDeployed {
            channel_id: config.id.clone(),
        })
        .await;
        info!(channel_id = %config.id, name = %config.name, "channel deployed");
        Ok(())
    }

    pub async fn undeploy(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        let state = *channel.state.read();
        if matches!(state, ChannelState::Started | ChannelState::Paused) {
            self.stop_channel(channel_id).await?;
        }

        if let Some(script) = &channel.config.undeploy_script {
            let mut scope = ScriptScope {
                channel_id: channel.config.id.clone(),
                channel_name: channel.config.name.clone(),
                ..Default::default()
            };
            if let Err(e) = with_timeout(
                self.config.script_timeout(),
                "undeploy script",
                self.script_engine.run_lifecycle_script(script, &mut scope),
            )
            .await
            {
                warn!(channel_id, error = %e, "undeploy script failed");
            }
        }

        self.channels.remove(channel_id);
        self.sequencer.forget_channel(channel_id);
        self.store
            .remove_deployment(&self.server_id, channel_id)
            .await?;
        self.publish(EngineEvent::ChannelUndeployed {
            channel_id: channel_id.to_string(),
        })
        .await;
        info!(channel_id, "channel undeployed");
        Ok(())
    }

    pub async fn deploy_all(
        self: &Arc<Self>,
        configs: Vec<ChannelConfig>,
    ) -> Vec<(String, EngineError)> {
        let mut errors = Vec::new();
        for config in configs {
            let id = config.id.clone();
            if let Err(e) = self.deploy(config).await {
                errors.push((id, e));
            }
        }
        errors
    }

    pub async fn undeploy_all(self: &Arc<Self>) -> Vec<(String, EngineError)> {
        let ids: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.undeploy(&id).await {
                errors.push((id, e));
            }
        }
        errors
    }

    pub async fn redeploy_all(
        self: &Arc<Self>,
        configs: Vec<ChannelConfig>,
    ) -> Vec<(String, EngineError)> {
        let mut errors = self.undeploy_all().await;
        errors.extend(self.deploy_all(configs).await);
        errors
    }

    // -- channel state transitions ------------------------------------------

    pub async fn start_channel(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        let state = *channel.state.read();
        if !matches!(state, ChannelState::Deployed | ChannelState::Halted) {
            return Err(EngineError::Configuration(format!(
                "channel {} cannot start from {}",
                channel_id, state
            )));
        }

        let _ = channel.signal.send(ChannelSignal::Run);
        let _ = channel.source_signal.send(ChannelSignal::Run);

        for runtime in channel.pipeline.destinations() {
            if let Some(queue) = &runtime.queue {
                queue.start().await?;
            }
        }
        self.start_source(&channel).await?;

        *channel.state.write() = ChannelState::Started;
        self.publish(EngineEvent::ChannelStateChanged {
            channel_id: channel_id.to_string(),
            state: ChannelState::Started.to_string(),
        })
        .await;
        info!(channel_id, "channel started");
        Ok(())
    }

    pub async fn stop_channel(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        let state = *channel.state.read();
        if !matches!(state, ChannelState::Started | ChannelState::Paused) {
            return Err(EngineError::Configuration(format!(
                "channel {} cannot stop from {}",
                channel_id, state
            )));
        }
        *channel.state.write() = ChannelState::Stopping;

        self.stop_source(&channel).await;
        let _ = channel.signal.send(ChannelSignal::Stop);

        let drain = async {
            for runtime in channel.pipeline.destinations() {
                if let Some(queue) = &runtime.queue {
                    queue.join().await;
                }
            }
        };
        if tokio::time::timeout(self.config.stop_grace(), drain)
            .await
            .is_err()
        {
            warn!(channel_id, "stop grace period expired, halting");
            let _ = channel.signal.send(ChannelSignal::Halt);
            for runtime in channel.pipeline.destinations() {
                if let Some(queue) = &runtime.queue {
                    queue.join().await;
                }
            }
        }

        *channel.state.write() = ChannelState::Deployed;
        self.publish(EngineEvent::ChannelStateChanged {
            channel_id: channel_id.to_string(),
            state: ChannelState::Deployed.to_string(),
        })
        .await;
        info!(channel_id, "channel stopped");
        Ok(())
    }

    /// Stop the source connector only; queues keep draining
    pub async fn pause_channel(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        let state = *channel.state.read();
        if state != ChannelState::Started {
            return Err(EngineError::Configuration(format!(
                "channel {} cannot pause from {}",
                channel_id, state
            )));
        }
        self.stop_source(&channel).await;
        *channel.state.write() = ChannelState::Paused;
        self.publish(EngineEvent::ChannelStateChanged {
            channel_id: channel_id.to_string(),
            state: ChannelState::Paused.to_string(),
        })
        .await;
        Ok(())
    }

    pub async fn resume_channel(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        let state = *channel.state.read();
        if state != ChannelState::Paused {
            return Err(EngineError::Configuration(format!(
                "channel {} cannot resume from {}",
                channel_id, state
            )));
        }
        let _ = channel.source_signal.send(ChannelSignal::Run);
        self.start_source(&channel).await?;
        *channel.state.write() = ChannelState::Started;
        self.publish(EngineEvent::ChannelStateChanged {
            channel_id: channel_id.to_string(),
            state: ChannelState::Started.to_string(),
        })
        .await;
        Ok(())
    }

    /// Forced abort: interrupts in-flight sends, which finalize as errors
    pub async fn halt_channel(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        let _ = channel.source_signal.send(ChannelSignal::Halt);
        let _ = channel.signal.send(ChannelSignal::Halt);
        self.stop_source(&channel).await;
        for runtime in channel.pipeline.destinations() {
            if let Some(queue) = &runtime.queue {
                queue.join().await;
            }
        }
        *channel.state.write() = ChannelState::Halted;
        self.publish(EngineEvent::ChannelStateChanged {
            channel_id: channel_id.to_string(),
            state: ChannelState::Halted.to_string(),
        })
        .await;
        warn!(channel_id, "channel halted");
        Ok(())
    }

    pub fn channel_state(&self, channel_id: &str) -> Option<ChannelState> {
        self.channels.get(channel_id).map(|c| *c.state.read())
    }

    /// The receive endpoint for event-driven sources: external callers and
    /// channel writers deliver raw messages here
    pub async fn dispatch_raw_message(
        &self,
        channel_id: &str,
        raw: RawMessage,
    ) -> Result<ReceiveOutcome> {
        let channel = self.get_channel(channel_id)?;
        let state = *channel.state.read();
        if state != ChannelState::Started {
            return Err(EngineError::Configuration(format!(
                "channel {} is not started (state {})",
                channel_id, state
            )));
        }
        channel.pipeline.receive(raw).await
    }

    // -- shadow mode --------------------------------------------------------

    /// While shadow mode is on, deployed-but-unpromoted channels refuse to
    /// run their sources and their receive endpoints signal shadow refusal
    pub async fn set_shadow_mode(self: &Arc<Self>, enabled: bool) {
        self.shadow_enabled.store(enabled, Ordering::SeqCst);
        for channel in self.channels.iter() {
            let gated = enabled && !self.promoted.contains(channel.key());
            channel.pipeline.set_shadow_gated(gated);
        }
        self.publish(EngineEvent::ShadowModeChanged { enabled }).await;
        info!(enabled, "shadow mode changed");
    }

    pub fn shadow_mode(&self) -> bool {
        self.shadow_enabled.load(Ordering::SeqCst)
    }

    /// Lift the shadow gate for one channel; its source starts immediately
    /// when the channel is already started
    pub async fn promote(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        self.promoted.insert(channel_id.to_string());
        let channel = self.get_channel(channel_id)?;
        channel.pipeline.set_shadow_gated(false);
        if *channel.state.read() == ChannelState::Started {
            self.start_source(&channel).await?;
        }
        info!(channel_id, "channel promoted");
        Ok(())
    }

    /// Promote every deployed channel, best effort, then leave shadow mode.
    /// Returns the per-channel failures.
    pub async fn cutover(self: &Arc<Self>) -> Vec<(String, EngineError)> {
        let ids: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.promote(&id).await {
                errors.push((id, e));
            }
        }
        self.set_shadow_mode(false).await;
        errors
    }

    // -- internals ----------------------------------------------------------

    fn get_channel(&self, channel_id: &str) -> Result<Arc<DeployedChannel>> {
        self.channels
            .get(channel_id)
            .map(|c| c.clone())
            .ok_or_else(|| {
                EngineError::Configuration(format!("channel {} is not deployed", channel_id))
            })
    }

    async fn start_source(&self, channel: &Arc<DeployedChannel>) -> Result<()> {
        let Some(source) = channel.source.clone() else {
            return Ok(());
        };
        if channel.pipeline.is_shadow_gated() {
            info!(
                channel_id = %channel.config.id,
                "source held dormant: channel is in shadow mode"
            );
            return Ok(());
        }
        if channel.source_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let lease = if source.is_polling() {
            let (tx, rx) = watch::channel(false);
            let handle = Arc::new(self.lease_manager.spawn(&channel.config.id, rx));
            *channel.lease_shutdown.lock() = Some(tx);
            *channel.lease.lock() = Some(handle.clone());
            Some(handle)
        } else {
            None
        };

        let ctx = SourceContext {
            channel_id: channel.config.id.clone(),
            channel_name: channel.config.name.clone(),
            receiver: channel.pipeline.clone() as Arc<dyn MessageReceiver>,
            lease,
            signal: channel.source_signal.subscribe(),
        };
        if let Err(e) = source.start(ctx).await {
            channel.source_running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn stop_source(&self, channel: &Arc<DeployedChannel>) {
        let _ = channel.source_signal.send(ChannelSignal::Stop);
        if channel.source_running.swap(false, Ordering::SeqCst) {
            if let Some(source) = &channel.source {
                if let Err(e) = source.stop().await {
                    warn!(channel_id = %channel.config.id, error = %e, "source stop failed");
                }
            }
        }
        let shutdown = channel.lease_shutdown.lock().take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        let lease = channel.lease.lock().take();
        if let Some(lease) = lease {
            if let Ok(lease) = Arc::try_unwrap(lease) {
                lease.join().await;
            }
        }
    }

    fn build_source_connector(
        &self,
        config: &ChannelConfig,
    ) -> Result<Option<Arc<dyn SourceConnector>>> {
        Ok(match &config.source.kind {
            SourceKind::ChannelReader => None,
            SourceKind::FileReader(settings) => {
                Some(Arc::new(FileReaderSource::new(settings.clone())))
            }
        })
    }

    fn build_destination_connector(
        self: &Arc<Self>,
        dest: &crate::model::DestinationConfig,
    ) -> Result<Arc<dyn DestinationConnector>> {
        Ok(match &dest.kind {
            DestinationKind::FileWriter(settings) => {
                Arc::new(FileWriterDestination::new(&dest.name, settings.clone()))
            }
            DestinationKind::ChannelWriter { target_channel_id } => {
                Arc::new(ChannelWriterDestination::new(
                    &dest.name,
                    target_channel_id,
                    self.clone() as Arc<dyn ChannelResolver>,
                ))
            }
            DestinationKind::Script { script } => Arc::new(ScriptDestination::new(
                &dest.name,
                script,
                self.script_engine.clone(),
                self.config.script_timeout(),
            )),
            DestinationKind::Transport { transport, target } => {
                let driver = self.transports.get(transport).map(|t| t.clone()).ok_or_else(
                    || {
                        EngineError::Configuration(format!(
                            "destination {} references unknown transport '{}'",
                            dest.name, transport
                        ))
                    },
                )?;
                Arc::new(TransportDestination::new(
                    &dest.name,
                    target,
                    driver,
                    self.config.dispatch_timeout(),
                ))
            }
        })
    }

    fn validate_channel(&self, config: &ChannelConfig) -> Result<()> {
        if config.name.trim().is_empty() {
            return Err(EngineError::Configuration("channel name is empty".into()));
        }
        crate::store::table_suffix(&config.id)?;
        if !self.data_types.contains(&config.source.data_type) {
            return Err(EngineError::Configuration(format!(
                "unknown source data type '{}'",
                config.source.data_type
            )));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for dest in &config.destinations {
            if dest.meta_data_id < 1 {
                return Err(EngineError::Configuration(format!(
                    "destination {} has metadata id {}; 0 is reserved for the source",
                    dest.name, dest.meta_data_id
                )));
            }
            if !seen_ids.insert(dest.meta_data_id) {
                return Err(EngineError::Configuration(format!(
                    "duplicate destination metadata id {}",
                    dest.meta_data_id
                )));
            }
            if !self.data_types.contains(&dest.data_type) {
                return Err(EngineError::Configuration(format!(
                    "destination {} uses unknown data type '{}'",
                    dest.name, dest.data_type
                )));
            }
        }

        let mut seen_columns = std::collections::HashSet::new();
        for column in &config.metadata_columns {
            let lowered = column.name.to_lowercase();
            if lowered.is_empty()
                || !lowered
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(EngineError::Configuration(format!(
                    "metadata column name '{}' is not a valid identifier",
                    column.name
                )));
            }
            if !seen_columns.insert(lowered) {
                return Err(EngineError::Configuration(format!(
                    "duplicate metadata column '{}'",
                    column.name
                )));
            }
        }
        Ok(())
    }

    async fn publish(&self, event: EngineEvent) {
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(error = %e, "event publish failed");
        }
    }
}

#[async_trait]
impl ChannelResolver for Engine {
    async fn dispatch_to_channel(&self, channel_id: &str, raw: RawMessage) -> Result<Response> {
        let outcome = self.dispatch_raw_message(channel_id, raw).await?;
        Ok(outcome
            .response
            .unwrap_or_else(|| Response::sent(format!("message {} accepted", outcome.message_id))))
    }
}
