use std::path::PathBuf;

use clap::Parser;
use docsync_collab::http::HttpConfig;
use docsync_collab::server::ServerConfig;
use docsync_collab::storage::StoreConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "docsync-server")]
#[command(about = "Document CRUD with change notifications over WebSocket and HTTP")]
pub struct Args {
    /// Address of the HTTP binding
    #[arg(long, env = "DOCSYNC_HTTP_ADDR", default_value = "127.0.0.1:3000")]
    pub http_addr: String,

    /// Address of the WebSocket binding
    #[arg(long, env = "DOCSYNC_WS_ADDR", default_value = "127.0.0.1:3001")]
    pub ws_addr: String,

    /// RocksDB directory; documents stay in memory when omitted
    #[arg(long, env = "DOCSYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Expose write routes on the HTTP binding
    #[arg(long, env = "DOCSYNC_HTTP_WRITES")]
    pub http_writes: bool,

    /// Change events buffered per peer
    #[arg(long, env = "DOCSYNC_BROADCAST_CAPACITY", default_value_t = 256)]
    pub broadcast_capacity: usize,
}

impl Args {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.ws_addr.clone(),
            broadcast_capacity: self.broadcast_capacity,
        }
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            bind_addr: self.http_addr.clone(),
            enable_writes: self.http_writes,
        }
    }

    pub fn store_config(&self) -> Option<StoreConfig> {
        self.data_dir.as_ref().map(StoreConfig::at)
    }
}
