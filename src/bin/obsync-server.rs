//! Sync core daemon entry point.

use std::sync::Arc;

use obsync_server::access::Gate;
use obsync_server::api::AppState;
use obsync_server::config::Config;
use obsync_server::logging;
use obsync_server::principal::StaticPrincipalResolver;
use obsync_server::realtime::Bus;
use obsync_server::store::chunks::FilesystemChunkStore;
use obsync_server::store::metadata::MetadataStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = Config::from_env();
    log::info!("starting obsync-server on {}", config.bind_addr);

    let store = MetadataStore::open(&config.db_path)?;
    let gate = Gate::new(store.clone());
    let bus = Bus::new();
    let chunks = Arc::new(FilesystemChunkStore::new(config.chunk_root.clone()));

    let state = AppState {
        store,
        gate,
        bus,
        chunks,
    };

    let resolver = Arc::new(StaticPrincipalResolver);
    let bind_addr = config.bind_addr.parse()?;

    obsync_server::server::serve(bind_addr, state, resolver).await?;
    Ok(())
}
