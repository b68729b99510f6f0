use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "streamrelay")]
#[command(author = "Streamrelay Team")]
#[command(version = "0.2.0")]
#[command(about = "Broadcast relay: long-poll WebRTC signaling and SFU forwarding", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/streamrelay.toml")]
    pub config: PathBuf,

    /// HTTP bind address
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Default new streams to direct-connect
    #[arg(long, action)]
    pub direct_connect: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of file and environment settings
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(ref host) = self.host {
            config.http.host = host.clone();
        }
        if let Some(port) = self.port {
            config.http.port = port;
        }
        if self.direct_connect {
            config.signaling.direct_connect = true;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}
