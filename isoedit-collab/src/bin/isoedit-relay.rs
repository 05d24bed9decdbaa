//! Standalone relay: `isoedit-relay [BIND_ADDR]` (default `127.0.0.1:9090`).

use isoedit_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }

    RelayServer::new(config).run().await
}
