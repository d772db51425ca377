use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use facility_monitoring::{
    actors::{DownsamplerHandle, HubHandle, OfflineHandle, SirenHandle, UpdaterHandle},
    alarms::AlarmManager,
    api::spawn_push_server,
    config::{read_config_file, Config, StorageConfig},
    listeners::spawn_listeners,
    storage::{MemoryBackend, StorageBackend},
};
use tokio::sync::broadcast;
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("facility_monitoring", LevelFilter::TRACE),
        ("collector", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

async fn open_storage(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match &config.storage {
        #[cfg(feature = "storage-sqlite")]
        Some(StorageConfig::Sqlite { path }) => {
            use facility_monitoring::storage::SqliteBackend;
            Ok(Arc::new(SqliteBackend::new(path).await?))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        Some(StorageConfig::Sqlite { .. }) => {
            anyhow::bail!("built without sqlite support, rebuild with --features storage-sqlite")
        }
        Some(StorageConfig::None) | None => {
            warn!("no storage configured, state will not survive a restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();

    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let storage = open_storage(&config).await?;

    // Configured sirens are seeded into storage so the synchronizer
    // and viewers see the same hardware table.
    for siren in &config.sirens {
        storage.upsert_siren(siren.clone()).await?;
    }

    let (events, _) = broadcast::channel(1024);

    let siren = SirenHandle::spawn(storage.clone(), events.clone());
    let alarms = AlarmManager::new(storage.clone(), events.clone(), siren.clone());
    let updater = UpdaterHandle::spawn(storage.clone(), events.clone(), alarms.clone());
    let offline = OfflineHandle::spawn(storage.clone(), events.clone(), alarms);
    let downsampler = DownsamplerHandle::spawn(storage.clone());
    let hub = HubHandle::spawn(
        storage.clone(),
        updater.clone(),
        siren.clone(),
        events.subscribe(),
    );

    // Align hardware with whatever alarm state survived the restart.
    siren.reconcile().await;

    let listeners = spawn_listeners(&config, &config.bind.to_string(), updater, events);
    info!("{} listener(s) running", listeners.len());

    let push_addr = SocketAddr::new(config.bind, config.ws_port);
    spawn_push_server(push_addr, hub).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // Stop taking input first, then the periodic tasks, then make sure
    // no siren is left on before storage goes away.
    for listener in listeners {
        listener.abort();
    }
    offline.shutdown().await;
    downsampler.shutdown().await;
    siren.silence().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    storage.close().await?;
    debug!("storage closed, bye");

    Ok(())
}
