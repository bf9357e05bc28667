//! Headless demo: a host and a client exchange player state and projectiles
//! over the in-process loopback network.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p ensemble-demo -- --seconds 20 --log-level debug`.

use std::f32::consts::TAU;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use clap::Parser;
use ensemble_config::{CliArgs, Config};
use ensemble_multiplayer::{
    CharacterIdentity, HostEngine, LocalPlayerState, ManualClock, Presentation, ProjectileState,
    RemotePlayerSnapshot, Session, WeaponSpec,
};
use ensemble_net::{LoopbackNetwork, PeerId, ProjectileId};
use glam::Vec2;
use tracing::info;

const HOST_ID: PeerId = PeerId(0x1000);
const CLIENT_ID: PeerId = PeerId(0x2000);
const STARTER_PISTOL: u32 = 1;

/// Demo arguments: the shared flags plus run length.
#[derive(Parser, Debug)]
#[command(name = "ensemble-demo", about = "Loopback host/client session demo")]
struct DemoArgs {
    #[command(flatten)]
    common: CliArgs,

    /// Simulated seconds to run.
    #[arg(long, default_value_t = 12.0)]
    seconds: f32,
}

/// Minimal stand-in for a game: one player walking in a circle.
struct SimulatedGame {
    name: &'static str,
    map: Mutex<String>,
    safe_locations: Vec<String>,
    player: Mutex<LocalPlayerState>,
    character: CharacterIdentity,
    radius: f32,
}

impl SimulatedGame {
    fn new(name: &'static str, config: &Config, character: CharacterIdentity, radius: f32) -> Arc<Self> {
        Arc::new(Self {
            name,
            map: Mutex::new("Foyer".to_string()),
            safe_locations: config.session.safe_locations.clone(),
            player: Mutex::new(LocalPlayerState {
                grounded: true,
                ..Default::default()
            }),
            character,
            radius,
        })
    }

    fn step(&self, t: f32) {
        let angle = t * TAU / 8.0;
        let mut player = self.player.lock().unwrap_or_else(PoisonError::into_inner);
        let next = Vec2::from_angle(angle) * self.radius;
        player.velocity = Vec2::new(-angle.sin(), angle.cos()) * self.radius * TAU / 8.0;
        player.position = next;
        player.rotation = player.velocity.y.atan2(player.velocity.x).to_degrees();
    }

    fn aim(&self) -> (Vec2, Vec2) {
        let player = self.player.lock().unwrap_or_else(PoisonError::into_inner);
        (player.position, -player.position)
    }
}

impl HostEngine for SimulatedGame {
    fn current_map_name(&self) -> String {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn local_player_ready(&self) -> bool {
        true
    }

    fn request_scene_load(&self, map_name: &str) {
        info!(game = self.name, map = map_name, "scene load requested");
        *self.map.lock().unwrap_or_else(PoisonError::into_inner) = map_name.to_string();
    }

    fn current_safe_location(&self) -> bool {
        let map = self.current_map_name();
        self.safe_locations.iter().any(|safe| *safe == map)
    }

    fn local_player(&self) -> Option<LocalPlayerState> {
        Some(
            self.player
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        )
    }

    fn local_character(&self) -> CharacterIdentity {
        self.character.clone()
    }
}

/// Logs every presentation callback.
struct LogPresentation {
    name: &'static str,
}

impl Presentation for LogPresentation {
    fn on_remote_snapshot_created(&self, peer: PeerId, snapshot: &RemotePlayerSnapshot) {
        info!(game = self.name, %peer, character = %snapshot.character_name, "remote player appeared");
    }

    fn on_remote_snapshot_updated(&self, peer: PeerId, snapshot: &RemotePlayerSnapshot) {
        tracing::trace!(game = self.name, %peer, clip = %snapshot.clip_name, "remote player moved");
    }

    fn on_remote_snapshot_removed(&self, peer: PeerId) {
        info!(game = self.name, %peer, "remote player removed");
    }

    fn on_authoritative_projectile_spawn(&self, id: ProjectileId, state: &ProjectileState) {
        info!(game = self.name, id = id.0, owner = %state.owner, "projectile spawned");
    }

    fn on_projectile_destroyed(&self, id: ProjectileId) {
        tracing::debug!(game = self.name, id = id.0, "projectile destroyed");
    }

    fn on_remote_visibility_changed(&self, peer: PeerId, visible: bool) {
        info!(game = self.name, %peer, visible, "remote player visibility changed");
    }
}

fn build_session(
    config: &Config,
    net: &LoopbackNetwork,
    clock: &Arc<ManualClock>,
    id: PeerId,
    game: Arc<SimulatedGame>,
) -> Arc<Session> {
    let presentation = Arc::new(LogPresentation { name: game.name });
    Session::builder(config.clone(), net.endpoint(id), game, presentation)
        .clock(clock.clone())
        .weapon(
            STARTER_PISTOL,
            WeaponSpec {
                speed: 22.0,
                damage: 4.0,
            },
        )
        .build()
}

fn main() {
    let args = DemoArgs::parse();

    // Resolve config directory
    let config_dir = args.common.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("ensemble")
    });

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args.common);

    let log_dir = config_dir.join("logs");
    ensemble_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let net = LoopbackNetwork::new();
    let clock = Arc::new(ManualClock::new(Instant::now()));
    let host_game = SimulatedGame::new("host", &config, CharacterIdentity::new(0, "Pilot"), 4.0);
    let client_game = SimulatedGame::new("client", &config, CharacterIdentity::new(2, "Marine"), 6.0);
    let host = build_session(&config, &net, &clock, HOST_ID, host_game.clone());
    let client = build_session(&config, &net, &clock, CLIENT_ID, client_game.clone());

    net.connect(HOST_ID, CLIENT_ID);
    if let Err(e) = host.start_session() {
        tracing::error!("failed to start session: {e}");
        return;
    }
    if let Err(e) = client.join_session(HOST_ID) {
        tracing::error!("failed to join session: {e}");
        host.stop_session();
        return;
    }
    net.pump();

    let tick_rate = config.session.tick_rate.max(1);
    let dt = Duration::from_secs_f32(1.0 / tick_rate as f32);
    let total_ticks = (args.seconds.max(0.0) * tick_rate as f32) as u64;
    let mut live: Vec<ProjectileId> = Vec::new();
    info!(tick_rate, total_ticks, "running loopback session");

    for tick in 0..total_ticks {
        let t = tick as f32 / tick_rate as f32;
        host_game.step(t);
        client_game.step(t);

        // Host fires every second, the client every 1.5 seconds.
        if tick % u64::from(tick_rate) == 0 {
            let (position, direction) = host_game.aim();
            if let Some(id) = host.fire(position, direction, STARTER_PISTOL) {
                live.push(id);
            }
        }
        if tick % (u64::from(tick_rate) * 3 / 2).max(1) == 0 {
            let (position, direction) = client_game.aim();
            client.fire(position, direction, STARTER_PISTOL);
        }
        // Projectiles live for two seconds.
        if live.len() > 2 {
            let id = live.remove(0);
            host.destroy_projectile(id);
        }

        // Halfway through, the client walks through a door.
        if tick == total_ticks / 2 {
            client.notify_scene_unloading();
            *client_game.map.lock().unwrap_or_else(PoisonError::into_inner) = "Foyer".into();
            client.notify_scene_loaded();
        }

        host.tick();
        client.tick();
        net.pump();
        clock.advance(dt);
    }

    for (name, session) in [("host", &host), ("client", &client)] {
        let stats = session.roll_network_stats();
        info!(
            game = name,
            sent = stats.current.bytes_sent,
            received = stats.current.bytes_received,
            remote_players = session.remote_snapshots().len(),
            "final period"
        );
    }

    client.stop_session();
    net.pump();
    host.stop_session();
    info!("demo finished");
}
