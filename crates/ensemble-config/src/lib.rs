//! Configuration for the Ensemble session and replication layer.
//!
//! Every tunable of the connection registry, replication engine, scene
//! coherence controller and authority gate lives here. Settings persist to
//! disk as RON, accept CLI overrides via clap, and support hot-reload
//! detection.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    AuthorityConfig, Config, ConnectionConfig, DebugConfig, NetworkConfig, ReplicationConfig,
    SceneConfig, SessionSettings, default_config_dir,
};
pub use error::ConfigError;
