//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Session orchestration settings.
    pub session: SessionSettings,
    /// Connection registry settings.
    pub connection: ConnectionConfig,
    /// Player-state replication settings.
    pub replication: ReplicationConfig,
    /// Scene transition settings.
    pub scene: SceneConfig,
    /// Projectile authority settings.
    pub authority: AuthorityConfig,
    /// Transport and codec settings.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Session orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Map names from which a session may be started or joined.
    pub safe_locations: Vec<String>,
    /// Simulation ticks per second driven by the embedding game loop.
    pub tick_rate: u32,
}

/// Connection registry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Seconds without any inbound packet before a connection is dropped.
    pub liveness_timeout_secs: f32,
    /// Seconds between liveness sweeps.
    pub sweep_interval_secs: f32,
    /// Seconds between HandshakeRequest retries while a client is handshaking.
    pub handshake_retry_secs: f32,
}

/// Player-state replication settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Minimum positional change (world units) that triggers a send.
    pub position_threshold: f32,
    /// Minimum rotation change (degrees) that triggers a send.
    pub rotation_threshold_deg: f32,
    /// Longest gap between two sends, even with unchanged state.
    pub max_send_interval_secs: f32,
    /// Expected interval between updates from a remote peer.
    pub heartbeat_interval_secs: f32,
    /// Heartbeats without an update before a remote snapshot is evicted.
    pub timeout_multiplier: f32,
    /// Multiplier used for restored snapshots and during local scene transitions.
    pub persistent_timeout_multiplier: f32,
    /// Base interpolation rate (per second) toward the target position.
    pub interpolation_rate: f32,
    /// Interpolation rate for freshly created snapshots.
    pub initial_interpolation_rate: f32,
    /// Seconds between local character identity checks.
    pub character_check_interval_secs: f32,
}

/// Scene transition settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SceneConfig {
    /// Longest wait for the local player before restoring best-effort.
    pub restore_timeout_secs: f32,
}

/// Projectile authority settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Seconds an id stays authorized after its spawn.
    pub authorization_grace_secs: f32,
    /// Maximum lifetime of a visual-only projectile.
    pub visual_projectile_lifetime_secs: f32,
    /// Seconds without an update before a visual-only projectile is discarded.
    pub visual_projectile_stale_secs: f32,
    /// Projectile speed for weapons missing from the catalog.
    pub default_projectile_speed: f32,
    /// Damage for weapons missing from the catalog.
    pub default_projectile_damage: f32,
    /// Distance from the shooter at which projectiles spawn.
    pub muzzle_offset: f32,
}

/// Transport and codec settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bind address for the UDP transport.
    pub bind_address: String,
    /// Bind port for the UDP transport.
    pub port: u16,
    /// Whether large packets are LZ4 compressed.
    pub compression_enabled: bool,
    /// Minimum encoded size (bytes) before compression is applied.
    pub compression_threshold: usize,
    /// Bytes per stats period above which a bandwidth warning is logged.
    pub bandwidth_warning_bytes: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Seconds between network statistics log lines.
    pub stats_interval_secs: f32,
}

// --- Default implementations ---

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            safe_locations: vec!["MainMenu".to_string(), "Foyer".to_string()],
            tick_rate: 60,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: 60.0,
            sweep_interval_secs: 1.0,
            handshake_retry_secs: 2.0,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            position_threshold: 0.1,
            rotation_threshold_deg: 5.0,
            max_send_interval_secs: 0.5,
            heartbeat_interval_secs: 1.0,
            timeout_multiplier: 6.0,
            persistent_timeout_multiplier: 30.0,
            interpolation_rate: 8.0,
            initial_interpolation_rate: 80.0,
            character_check_interval_secs: 1.0,
        }
    }
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            restore_timeout_secs: 10.0,
        }
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            authorization_grace_secs: 1.0,
            visual_projectile_lifetime_secs: 10.0,
            visual_projectile_stale_secs: 2.0,
            default_projectile_speed: 18.0,
            default_projectile_damage: 5.0,
            muzzle_offset: 0.5,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 7777,
            compression_enabled: true,
            compression_threshold: 256,
            bandwidth_warning_bytes: 1024 * 1024,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            stats_interval_secs: 5.0,
        }
    }
}

// --- Duration accessors ---

/// Converts a seconds value from the config file into a [`Duration`],
/// clamping negative and NaN values to zero.
fn secs(value: f32) -> Duration {
    Duration::try_from_secs_f32(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl ConnectionConfig {
    /// Liveness timeout as a [`Duration`].
    pub fn liveness_timeout(&self) -> Duration {
        secs(self.liveness_timeout_secs)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        secs(self.sweep_interval_secs)
    }

    /// Handshake retry interval as a [`Duration`].
    pub fn handshake_retry(&self) -> Duration {
        secs(self.handshake_retry_secs)
    }
}

impl ReplicationConfig {
    /// Maximum send interval as a [`Duration`].
    pub fn max_send_interval(&self) -> Duration {
        secs(self.max_send_interval_secs)
    }

    /// Standard eviction timeout: heartbeat interval times the timeout multiplier.
    pub fn snapshot_timeout(&self) -> Duration {
        secs(self.heartbeat_interval_secs * self.timeout_multiplier)
    }

    /// Eviction timeout for restored snapshots and during scene transitions.
    pub fn persistent_snapshot_timeout(&self) -> Duration {
        secs(self.heartbeat_interval_secs * self.persistent_timeout_multiplier)
    }

    /// Character identity check interval as a [`Duration`].
    pub fn character_check_interval(&self) -> Duration {
        secs(self.character_check_interval_secs)
    }
}

impl SceneConfig {
    /// Restore timeout as a [`Duration`].
    pub fn restore_timeout(&self) -> Duration {
        secs(self.restore_timeout_secs)
    }
}

impl AuthorityConfig {
    /// Authorization grace period as a [`Duration`].
    pub fn authorization_grace(&self) -> Duration {
        secs(self.authorization_grace_secs)
    }

    /// Visual projectile lifetime as a [`Duration`].
    pub fn visual_projectile_lifetime(&self) -> Duration {
        secs(self.visual_projectile_lifetime_secs)
    }

    /// Visual projectile staleness limit as a [`Duration`].
    pub fn visual_projectile_stale(&self) -> Duration {
        secs(self.visual_projectile_stale_secs)
    }
}

impl DebugConfig {
    /// Stats logging interval as a [`Duration`].
    pub fn stats_interval(&self) -> Duration {
        secs(self.stats_interval_secs)
    }
}

/// Default per-user config directory (`<platform config dir>/ensemble`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("ensemble"))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Load / Save / Reload ---

const CONFIG_FILE: &str = "config.ron";

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults there first
    /// if the file does not exist.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("wrote default config to {}", path.display());
            return Ok(config);
        }
        let config = read_config(&path)?;
        log::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Write this config to `config_dir/config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        let write_err = |source| ConfigError::Write {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(config_dir).map_err(write_err)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty)?;
        std::fs::write(&path, serialized).map_err(write_err)
    }

    /// Re-read the file. Returns `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = read_config(&config_dir.join(CONFIG_FILE))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("config changed on disk");
        Ok(Some(fresh))
    }
}
