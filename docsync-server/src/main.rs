mod config;

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use config::Args;
use docsync_collab::mediator::Mediator;
use docsync_collab::server::RealtimeServer;
use docsync_collab::storage::{DocumentStore, StorageAdapter, StorageEngine};
use docsync_collab::{http, MemoryEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::init();
    let args = Args::parse();

    let engine: Arc<dyn StorageEngine> = match args.store_config() {
        Some(store_config) => {
            log::info!("Opening RocksDB store at {}", store_config.path.display());
            Arc::new(DocumentStore::open(store_config)?)
        }
        None => {
            log::warn!("No data directory configured, documents are kept in memory");
            Arc::new(MemoryEngine::new())
        }
    };
    let adapter = StorageAdapter::new(engine);
    log::info!("Storage engine: {}", adapter.engine_kind());

    // Both bindings share one mediator; only the WebSocket side broadcasts
    let mediator = Arc::new(Mediator::new(Arc::new(adapter)));
    let realtime = RealtimeServer::new(args.server_config(), Arc::clone(&mediator));

    tokio::try_join!(
        async { realtime.run().await },
        async {
            http::serve(Arc::clone(&mediator), args.http_config())
                .await
                .map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>)
        },
    )?;
    Ok(())
}
