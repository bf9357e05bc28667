//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Ensemble command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "ensemble", about = "Ensemble peer-to-peer session layer")]
pub struct CliArgs {
    /// UDP bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// UDP bind port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Connection liveness timeout in seconds.
    #[arg(long)]
    pub liveness_timeout: Option<f32>,

    /// Remote snapshot heartbeat interval in seconds.
    #[arg(long)]
    pub heartbeat: Option<f32>,

    /// Simulation tick rate in Hz.
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.network.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(timeout) = args.liveness_timeout {
            self.connection.liveness_timeout_secs = timeout;
        }
        if let Some(heartbeat) = args.heartbeat {
            self.replication.heartbeat_interval_secs = heartbeat;
        }
        if let Some(rate) = args.tick_rate {
            self.session.tick_rate = rate;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
