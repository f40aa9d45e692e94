//! `PeerDrop` signaling relay.
//!
//! An axum WebSocket server that lets two peers in the same room exchange
//! negotiation payloads. The relay reads only the `type`/`room` envelope and
//! forwards the payload verbatim.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:3000
//! cargo run --bin peerdrop-relay
//!
//! # Run on a custom port
//! cargo run --bin peerdrop-relay -- --port 8080
//!
//! # Or via environment variable
//! PORT=8080 cargo run --bin peerdrop-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use peerdrop_relay::config::{RelayCliArgs, RelayConfig};
use peerdrop_relay::relay::{self, RelayState};

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let bind_addr = config.bind_addr();
    tracing::info!(addr = %bind_addr, "starting peerdrop relay");

    let state = Arc::new(RelayState::with_config(config.max_message_size));

    match relay::start_server_with_state(&bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "signaling server listening");
            tokio::select! {
                result = handle => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "relay server task failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
