//! Scribe sync server.
//!
//! Usage: `scribe-server [ADDR]`. The bind address comes from the first
//! argument, then `SCRIBE_BIND`, then the default `127.0.0.1:9090`. Log
//! output is controlled with `RUST_LOG`.

use scribe_collab::server::{ServerConfig, SyncServer};

fn bind_addr(arg: Option<String>, env: Option<String>) -> Option<String> {
    arg.or(env).filter(|addr| !addr.trim().is_empty())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = ServerConfig::default();
    if let Some(addr) = bind_addr(std::env::args().nth(1), std::env::var("SCRIBE_BIND").ok()) {
        config.bind_addr = addr;
    }

    log::info!(
        "Starting Scribe sync server on {} (max {} peers per room)",
        config.bind_addr,
        config.max_peers_per_room
    );
    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
