use std::sync::Arc;

use fieldsync_core::{load_config, BlobStore, Config, MemoryRemote, RemoteStore, SyncEngine};
use fieldsync_events::Bus;
use fieldsync_kernel::LocalStore;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, EnvFilter};

mod http_remote;

use http_remote::HttpRemote;

fn load() -> anyhow::Result<Config> {
    match std::env::var("FIELDSYNC_CONFIG") {
        Ok(path) => {
            let cfg = load_config(&path)?;
            tracing::info!("loaded config from {}", path);
            Ok(cfg)
        }
        Err(_) => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let cfg = load()?;
    let store = LocalStore::open(&cfg.state_dir())?;
    let bus = Bus::default();

    let (remote, blob): (Arc<dyn RemoteStore>, Arc<dyn BlobStore>) =
        match cfg.remote.base_url.as_deref() {
            Some(url) => {
                let http = Arc::new(HttpRemote::from_config(url, &cfg.remote)?);
                tracing::info!("fieldsync-connector syncing with {}", url);
                let remote: Arc<dyn RemoteStore> = http.clone();
                let blob: Arc<dyn BlobStore> = http;
                (remote, blob)
            }
            None => {
                tracing::warn!("remote.base_url not set; running against an in-process remote");
                let mem = MemoryRemote::new();
                let remote: Arc<dyn RemoteStore> = Arc::new(mem.clone());
                let blob: Arc<dyn BlobStore> = Arc::new(mem);
                (remote, blob)
            }
        };

    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(env) => tracing::debug!(target: "fieldsync-connector", kind = %env.kind, payload = %env.payload, "event"),
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!(target: "fieldsync-connector", skipped = n, "event log lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let engine = SyncEngine::start(&cfg, store, remote, blob, bus)?;

    // Wait for Ctrl+C to allow graceful shutdown
    let _ = tokio::signal::ctrl_c().await;
    engine.shutdown().await;
    Ok(())
}
