//! Meridian Server - standalone integration engine node
//!
//! Runs one engine node: connects the message store, wires the configured
//! cluster backends, deploys channel definitions from disk and runs until
//! interrupted.

use anyhow::{Context, Result};
use clap::{Arg, Command};
use meridian::{
    AesContentEncryptor, ChannelConfig, Config, ContentEncryptor, DatabaseMapBackend,
    DbPollingEventBus, Engine, EventBus, EventBusKind, GlobalMaps, InMemoryMapBackend,
    InMemoryStore, LocalEventBus, MapBackend, MapBackendKind, NoopEncryptor,
    PassthroughScriptEngine, RedisEventBus, RedisMapBackend, SqlStore, Store, StoreBackendKind,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("meridian-server")
        .version(meridian::VERSION)
        .about("Meridian clinical data integration engine")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file")
                .num_args(1),
        )
        .arg(
            Arg::new("channels")
                .long("channels")
                .value_name("DIR")
                .help("Directory of channel definition JSON files to deploy at startup")
                .num_args(1),
        )
        .arg(
            Arg::new("start-all")
                .long("start-all")
                .help("Start every deployed channel after deployment")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("shadow")
                .long("shadow")
                .help("Begin in shadow mode; channels deploy but sources stay dormant")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => {
            Config::from_file(path).with_context(|| format!("loading config from {}", path))?
        }
        None => Config::default(),
    };
    config.validate().context("invalid configuration")?;

    init_logging(&config);
    info!(version = meridian::VERSION, "meridian server starting");

    let encryptor: Arc<dyn ContentEncryptor> = if config.encryption.enabled {
        match (&config.encryption.key, &config.encryption.passphrase) {
            (Some(key), _) => Arc::new(AesContentEncryptor::from_base64_key(key)?),
            (None, Some(passphrase)) => Arc::new(AesContentEncryptor::from_passphrase(passphrase)),
            (None, None) => unreachable!("validated above"),
        }
    } else {
        Arc::new(NoopEncryptor)
    };

    let store: Arc<dyn Store> = match config.database.backend {
        StoreBackendKind::Postgres => Arc::new(
            SqlStore::connect_with_encryptor(
                &config.database.url,
                config.database.max_connections,
                encryptor,
            )
            .await?,
        ),
        StoreBackendKind::Memory => {
            warn!("memory store selected; messages will not survive a restart");
            Arc::new(InMemoryStore::with_encryptor(encryptor))
        }
    };

    let server_id = config.server_id();
    let map_backend: Arc<dyn MapBackend> = match config.cluster.map_backend {
        MapBackendKind::Memory => Arc::new(InMemoryMapBackend::new()),
        MapBackendKind::Database => match config.database.backend {
            StoreBackendKind::Postgres => {
                let sql = SqlStore::connect(&config.database.url, 4).await?;
                Arc::new(DatabaseMapBackend::new(sql.pool().clone()))
            }
            StoreBackendKind::Memory => Arc::new(InMemoryMapBackend::new()),
        },
        MapBackendKind::Redis => {
            let url = config.cluster.redis_url.as_ref().expect("validated above");
            Arc::new(RedisMapBackend::new(url)?)
        }
    };
    let event_bus: Arc<dyn EventBus> = match config.cluster.event_bus {
        EventBusKind::Local => Arc::new(LocalEventBus::new(server_id.clone())),
        EventBusKind::Database => Arc::new(DbPollingEventBus::new(
            store.clone(),
            server_id.clone(),
            config.event_poll_interval(),
        )),
        EventBusKind::Redis => {
            let url = config.cluster.redis_url.as_ref().expect("validated above");
            Arc::new(RedisEventBus::new(url, server_id.clone())?)
        }
    };

    let maps = Arc::new(GlobalMaps::new(map_backend));
    let shadow = matches.get_flag("shadow");
    let engine = Engine::new(
        config,
        store,
        event_bus,
        maps,
        Arc::new(PassthroughScriptEngine),
    );
    engine.start().await?;
    if shadow {
        engine.set_shadow_mode(true).await;
    }

    if let Some(dir) = matches.get_one::<String>("channels") {
        let configs = load_channel_definitions(&PathBuf::from(dir))?;
        let ids: Vec<String> = configs.iter().map(|c| c.id.clone()).collect();
        info!(count = configs.len(), "deploying channel definitions");
        for (id, e) in engine.deploy_all(configs).await {
            error!(channel_id = %id, error = %e, "channel deploy failed");
        }
        if matches.get_flag("start-all") {
            for id in ids {
                if let Err(e) = engine.start_channel(&id).await {
                    error!(channel_id = %id, error = %e, "channel start failed");
                }
            }
        }
    }

    info!("engine running; press ctrl-c to stop");
    signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    engine.shutdown().await?;
    Ok(())
}

fn init_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format.as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
}

fn load_channel_definitions(dir: &PathBuf) -> Result<Vec<ChannelConfig>> {
    let mut configs = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading channel directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading channel definition {}", path.display()))?;
        match serde_json::from_str::<ChannelConfig>(&content) {
            Ok(config) => configs.push(config),
            Err(e) => error!(file = %path.display(), error = %e, "unreadable channel definition"),
        }
    }
    Ok(configs)
}
