//! Standalone relay server.
//!
//! ```text
//! RUST_LOG=info duet-relay --bind 0.0.0.0:9090
//! ```

use clap::Parser;
use duet_collab::{RelayConfig, RelayServer};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "duet-relay", version, about = "Room-scoped relay for Duet sessions")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Maximum peers admitted to one room
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Frames buffered per peer before dropping
    #[arg(long, default_value_t = 256)]
    peer_buffer: usize,

    /// Seconds a new connection has to send its join frame
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = RelayConfig {
        bind_addr: args.bind,
        max_peers_per_room: args.max_peers,
        peer_buffer: args.peer_buffer,
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
    };

    let server = match RelayServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
