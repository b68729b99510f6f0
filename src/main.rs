//! streamrelay - main entry point
//!
//! Serves the HTTP signaling API and relays WebRTC media to viewers.

use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use streamrelay_core::args::Args;
use streamrelay_core::config::Config;
use streamrelay_core::rtc::PeerConnectionFactory;
use streamrelay_core::stream::{BroadcastRegistry, StreamSettings};
use streamrelay_core::web::{run_http_server, SharedState};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    let loaded = args.load_config();
    let mut config = loaded.as_ref().cloned().unwrap_or_default();
    args.apply_overrides(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("RELAY_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("streamrelay v{}", env!("CARGO_PKG_VERSION"));
    match &loaded {
        Ok(_) => info!("Loaded configuration from {:?}", args.config),
        Err(e) => warn!("Failed to load config: {}, using defaults", e),
    }

    // Environment first, then command line flags win again
    config.apply_env()?;
    args.apply_overrides(&mut config);
    config.validate()?;

    info!(
        "Signaling: default {}, viewer poll {}s, capture poll {}s, keepalive {}s",
        if config.signaling.direct_connect { "direct-connect" } else { "relayed" },
        config.signaling.viewer_poll_timeout_secs,
        config.signaling.capture_poll_timeout_secs,
        config.signaling.keepalive_secs
    );
    info!("ICE servers: {}", config.ice_servers.len());

    let factory = PeerConnectionFactory::bind(config.webrtc.clone(), config.ice_servers.clone()).await?;
    let streams = BroadcastRegistry::new(factory, StreamSettings::from_config(&config.signaling));
    let state = Arc::new(SharedState::new(config, streams)?);

    tokio::select! {
        result = run_http_server(state) => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
                return Err(e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("streamrelay stopped");
    Ok(())
}
