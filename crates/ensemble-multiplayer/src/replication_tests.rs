//! Unit tests for player-state replication.

use super::*;

const REMOTE: PeerId = PeerId(20);
const LOCAL: PeerId = PeerId(10);
const TICK: Duration = Duration::from_millis(16);

fn engine() -> ReplicationEngine {
    let engine = ReplicationEngine::new(ReplicationConfig::default());
    engine.begin(LOCAL);
    engine
}

fn frame_at(x: f32, y: f32) -> LocalFrame {
    LocalFrame {
        player: Some(LocalPlayerState {
            position: Vec2::new(x, y),
            grounded: true,
            ..Default::default()
        }),
        map_name: "Foyer".to_string(),
    }
}

fn update_at(x: f32, y: f32) -> PositionUpdate {
    PositionUpdate {
        position: Vec2::new(x, y),
        velocity: Vec2::ZERO,
        rotation: 0.0,
        grounded: true,
        dodge_rolling: false,
        map_name: "Foyer".to_string(),
        anim_state: AnimationState::Idle,
        movement_dir: Vec2::ZERO,
        clip_name: "idle_east".to_string(),
        character: None,
    }
}

fn pilot() -> CharacterIdentity {
    CharacterIdentity::new(3, "Pilot")
}

/// Drain the position updates broadcast into `effects`.
fn sent(effects: &mut Effects) -> Vec<PositionUpdate> {
    effects
        .outbound
        .drain(..)
        .filter_map(|o| match o {
            Outbound::Broadcast(Message::PositionUpdate(u)) => Some(u),
            _ => None,
        })
        .collect()
}

fn removals(effects: &Effects, peer: PeerId) -> usize {
    effects
        .events
        .iter()
        .filter(|e| **e == PresentationEvent::SnapshotRemoved(peer))
        .count()
}

/// Compare tables ignoring the cosmetic `restored` flag and the rate.
fn normalized(mut table: Vec<RemotePlayerSnapshot>) -> Vec<RemotePlayerSnapshot> {
    table.sort_by_key(|s| s.peer_id);
    for s in &mut table {
        s.restored = false;
        s.interpolation_rate = 0.0;
    }
    table
}

// ---------------------------------------------------------------------------
// Send path
// ---------------------------------------------------------------------------

#[test]
fn test_threshold_then_heartbeat() {
    let engine = engine();
    let start = Instant::now();
    let mut fx = Effects::new();

    engine.tick_send(start, &frame_at(0.0, 0.0), Some(pilot()), true, &mut fx);
    let first = sent(&mut fx);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].character, Some(CharacterInfo::from(&pilot())));

    // Below the 0.1 threshold and before the heartbeat: nothing.
    let t = start + Duration::from_millis(400);
    engine.tick_send(t, &frame_at(0.05, 0.0), None, true, &mut fx);
    assert!(sent(&mut fx).is_empty());

    // Heartbeat at 0.5s even though the position barely moved.
    let t = start + Duration::from_millis(500);
    engine.tick_send(t, &frame_at(0.05, 0.0), None, true, &mut fx);
    let heartbeat = sent(&mut fx);
    assert_eq!(heartbeat.len(), 1);
    assert_eq!(heartbeat[0].position, Vec2::new(0.05, 0.0));
    assert_eq!(heartbeat[0].character, None, "identity already sent");
}

#[test]
fn test_nothing_sent_without_ready_peer() {
    let engine = engine();
    let mut fx = Effects::new();
    engine.tick_send(Instant::now(), &frame_at(0.0, 0.0), Some(pilot()), false, &mut fx);
    assert!(fx.outbound.is_empty());
}

#[test]
fn test_nothing_sent_without_local_player() {
    let engine = engine();
    let mut fx = Effects::new();
    let frame = LocalFrame {
        player: None,
        map_name: "Foyer".into(),
    };
    engine.tick_send(Instant::now(), &frame, Some(pilot()), true, &mut fx);
    assert!(fx.outbound.is_empty());
}

#[test]
fn test_movement_rotation_and_flags_trigger_sends() {
    let engine = engine();
    let start = Instant::now();
    let mut fx = Effects::new();
    engine.tick_send(start, &frame_at(0.0, 0.0), Some(pilot()), true, &mut fx);
    sent(&mut fx);

    let t = start + Duration::from_millis(50);
    engine.tick_send(t, &frame_at(0.2, 0.0), None, true, &mut fx);
    assert_eq!(sent(&mut fx).len(), 1, "moved past threshold");

    let mut rotated = frame_at(0.2, 0.0);
    rotated.player.as_mut().unwrap().rotation = 6.0;
    engine.tick_send(t, &rotated, None, true, &mut fx);
    assert_eq!(sent(&mut fx).len(), 1, "rotated past 5 degrees");

    let mut airborne = rotated.clone();
    airborne.player.as_mut().unwrap().grounded = false;
    engine.tick_send(t, &airborne, None, true, &mut fx);
    assert_eq!(sent(&mut fx).len(), 1, "grounded flag flipped");

    let mut rolling = airborne.clone();
    rolling.player.as_mut().unwrap().dodge_rolling = true;
    engine.tick_send(t, &rolling, None, true, &mut fx);
    let update = sent(&mut fx);
    assert_eq!(update.len(), 1, "dodge flag flipped");
    assert_eq!(update[0].anim_state, AnimationState::DodgeRolling);

    let mut moved_map = rolling.clone();
    moved_map.map_name = "Keep".into();
    engine.tick_send(t, &moved_map, None, true, &mut fx);
    assert_eq!(sent(&mut fx).len(), 1, "map changed");

    engine.tick_send(t, &moved_map, None, true, &mut fx);
    assert!(sent(&mut fx).is_empty());
}

#[test]
fn test_rotation_wraps_around() {
    let engine = engine();
    let start = Instant::now();
    let mut fx = Effects::new();
    let mut frame = frame_at(0.0, 0.0);
    frame.player.as_mut().unwrap().rotation = 359.0;
    engine.tick_send(start, &frame, Some(pilot()), true, &mut fx);
    sent(&mut fx);

    frame.player.as_mut().unwrap().rotation = 2.0;
    engine.tick_send(start, &frame, None, true, &mut fx);
    assert!(sent(&mut fx).is_empty(), "359 -> 2 is only 3 degrees");
}

#[test]
fn test_character_change_forces_update_with_identity() {
    let engine = engine();
    let start = Instant::now();
    let mut fx = Effects::new();
    engine.tick_send(start, &frame_at(0.0, 0.0), Some(pilot()), true, &mut fx);
    sent(&mut fx);

    let t = start + Duration::from_millis(200);
    assert!(!engine.character_check_due(t));
    let t = start + Duration::from_secs(1);
    assert!(engine.character_check_due(t));

    let hunter = CharacterIdentity::new(5, "Hunter");
    engine.tick_send(t, &frame_at(0.0, 0.0), Some(hunter.clone()), true, &mut fx);
    let forced = sent(&mut fx);
    assert_eq!(forced.len(), 1);
    assert_eq!(forced[0].character, Some(CharacterInfo::from(&hunter)));
    assert!(!engine.character_check_due(t));
}

#[test]
fn test_unchanged_character_check_sends_nothing() {
    let engine = engine();
    let start = Instant::now();
    let mut fx = Effects::new();
    engine.tick_send(start, &frame_at(0.0, 0.0), Some(pilot()), true, &mut fx);
    sent(&mut fx);

    let t = start + Duration::from_millis(100);
    engine.tick_send(t, &frame_at(0.0, 0.0), Some(pilot()), true, &mut fx);
    assert!(sent(&mut fx).is_empty());
}

#[test]
fn test_new_ready_peer_gets_identity_again() {
    let engine = engine();
    let start = Instant::now();
    let mut fx = Effects::new();
    engine.tick_send(start, &frame_at(0.0, 0.0), Some(pilot()), true, &mut fx);
    sent(&mut fx);

    engine.on_peer_ready();
    engine.tick_send(start, &frame_at(0.0, 0.0), None, true, &mut fx);
    let update = sent(&mut fx);
    assert_eq!(update.len(), 1);
    assert_eq!(update[0].character, Some(CharacterInfo::from(&pilot())));
}

// ---------------------------------------------------------------------------
// Receive path
// ---------------------------------------------------------------------------

#[test]
fn test_first_update_creates_snapshot() {
    let engine = engine();
    let now = Instant::now();
    let mut fx = Effects::new();

    assert!(engine.apply_update(REMOTE, &update_at(1.0, 2.0), now, &mut fx));
    assert!(!engine.apply_update(REMOTE, &update_at(3.0, 2.0), now, &mut fx));

    assert!(matches!(fx.events[0], PresentationEvent::SnapshotCreated(ref s) if s.peer_id == REMOTE));
    assert!(matches!(fx.events[1], PresentationEvent::SnapshotUpdated(_)));
    let snapshot = engine.snapshot(REMOTE).unwrap();
    assert_eq!(snapshot.target_position, Vec2::new(3.0, 2.0));
    assert_eq!(snapshot.position, Vec2::new(1.0, 2.0));
    assert_eq!(snapshot.character_id, CharacterIdentity::NONE_ID);
}

#[test]
fn test_update_from_self_ignored() {
    let engine = engine();
    let mut fx = Effects::new();
    assert!(!engine.apply_update(LOCAL, &update_at(0.0, 0.0), Instant::now(), &mut fx));
    assert!(engine.is_empty());
}

#[test]
fn test_absent_character_leaves_identity_unchanged() {
    let engine = engine();
    let now = Instant::now();
    let mut fx = Effects::new();
    let mut with_identity = update_at(0.0, 0.0);
    with_identity.character = Some(CharacterInfo::from(&pilot()));
    engine.apply_update(REMOTE, &with_identity, now, &mut fx);
    engine.apply_update(REMOTE, &update_at(1.0, 0.0), now, &mut fx);

    assert_eq!(engine.snapshot(REMOTE).unwrap().character(), pilot());
}

#[test]
fn test_target_tracks_last_update_and_position_converges_monotonically() {
    let engine = engine();
    let mut now = Instant::now();
    let mut fx = Effects::new();
    engine.apply_update(REMOTE, &update_at(0.0, 0.0), now, &mut fx);

    let targets = [
        Vec2::new(5.0, 0.0),
        Vec2::new(5.0, 3.0),
        Vec2::new(-2.0, 8.0),
    ];
    for target in targets {
        engine.apply_update(REMOTE, &update_at(target.x, target.y), now, &mut fx);
        let mut previous = f32::INFINITY;
        for _ in 0..120 {
            now += TICK;
            engine.tick_remote(now, TICK, "Foyer", false, &mut fx);
            let snapshot = engine.snapshot(REMOTE).unwrap();
            assert_eq!(snapshot.target_position, target);
            let distance = snapshot.position.distance(target);
            assert!(distance <= previous + 1e-5, "{distance} > {previous}");
            previous = distance;
        }
        assert!(previous < 1e-3, "did not converge: {previous}");
    }
}

#[test]
fn test_boosted_rate_drops_to_base_after_convergence() {
    let engine = engine();
    let mut now = Instant::now();
    let mut fx = Effects::new();
    engine.apply_update(REMOTE, &update_at(0.0, 0.0), now, &mut fx);
    engine.apply_update(REMOTE, &update_at(10.0, 0.0), now, &mut fx);
    assert_eq!(engine.snapshot(REMOTE).unwrap().interpolation_rate, 80.0);

    let small = Duration::from_millis(5);
    let mut converged = false;
    for _ in 0..20 {
        now += small;
        engine.tick_remote(now, small, "Foyer", false, &mut fx);
        let snapshot = engine.snapshot(REMOTE).unwrap();
        if snapshot.interpolation_rate == 8.0 {
            assert!(snapshot.position.distance(snapshot.target_position) <= 0.1);
            converged = true;
            break;
        }
    }
    assert!(converged);
}

#[test]
fn test_interpolation_emits_updates_only_when_moving() {
    let engine = engine();
    let now = Instant::now();
    let mut fx = Effects::new();
    engine.apply_update(REMOTE, &update_at(0.0, 0.0), now, &mut fx);
    fx.events.clear();

    engine.tick_remote(now + TICK, TICK, "Foyer", false, &mut fx);
    assert!(fx.events.is_empty());

    engine.apply_update(REMOTE, &update_at(1.0, 0.0), now, &mut fx);
    fx.events.clear();
    engine.tick_remote(now + TICK, TICK, "Foyer", false, &mut fx);
    assert_eq!(fx.events.len(), 1);
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

#[test]
fn test_stale_snapshot_evicted_exactly_once() {
    let engine = engine();
    let start = Instant::now();
    let mut fx = Effects::new();
    engine.apply_update(REMOTE, &update_at(0.0, 0.0), start, &mut fx);

    let mut now = start;
    while now < start + Duration::from_millis(5_900) {
        now += Duration::from_millis(100);
        engine.tick_remote(now, Duration::from_millis(100), "Foyer", false, &mut fx);
    }
    assert!(engine.snapshot(REMOTE).is_some(), "still inside 6s window");

    while now < start + Duration::from_secs(12) {
        now += Duration::from_millis(100);
        engine.tick_remote(now, Duration::from_millis(100), "Foyer", false, &mut fx);
    }
    assert!(engine.snapshot(REMOTE).is_none());
    assert_eq!(removals(&fx, REMOTE), 1);
}

#[test]
fn test_transition_uses_persistent_timeout() {
    let engine = engine();
    let start = Instant::now();
    let mut fx = Effects::new();
    engine.apply_update(REMOTE, &update_at(0.0, 0.0), start, &mut fx);

    let now = start + Duration::from_secs(20);
    engine.tick_remote(now, TICK, "Foyer", true, &mut fx);
    assert!(engine.snapshot(REMOTE).is_some());

    engine.tick_remote(start + Duration::from_secs(31), TICK, "Foyer", true, &mut fx);
    assert!(engine.snapshot(REMOTE).is_none());
}

#[test]
fn test_restored_snapshot_uses_persistent_until_refreshed() {
    let engine = engine();
    let start = Instant::now();
    let mut fx = Effects::new();
    engine.apply_update(REMOTE, &update_at(0.0, 0.0), start, &mut fx);
    let persisted = engine.suspend();
    engine.resume();
    engine.restore(persisted, &mut fx);
    assert!(engine.snapshot(REMOTE).unwrap().restored);

    engine.tick_remote(start + Duration::from_secs(10), TICK, "Foyer", false, &mut fx);
    assert!(engine.snapshot(REMOTE).is_some(), "restored: 30s window");

    // A fresh update clears the flag and the standard window applies again.
    let refreshed = start + Duration::from_secs(11);
    engine.apply_update(REMOTE, &update_at(0.0, 0.0), refreshed, &mut fx);
    assert!(!engine.snapshot(REMOTE).unwrap().restored);
    engine.tick_remote(refreshed + Duration::from_secs(7), TICK, "Foyer", false, &mut fx);
    assert!(engine.snapshot(REMOTE).is_none());
}

#[test]
fn test_remove_peer_reports_once() {
    let engine = engine();
    let mut fx = Effects::new();
    engine.apply_update(REMOTE, &update_at(0.0, 0.0), Instant::now(), &mut fx);
    assert!(engine.remove_peer(REMOTE, &mut fx));
    assert!(!engine.remove_peer(REMOTE, &mut fx));
    assert_eq!(removals(&fx, REMOTE), 1);
}

// ---------------------------------------------------------------------------
// Visibility
// ---------------------------------------------------------------------------

#[test]
fn test_snapshot_on_other_map_is_hidden_then_shown() {
    let engine = engine();
    let now = Instant::now();
    let mut fx = Effects::new();
    engine.tick_remote(now, TICK, "Foyer", false, &mut fx);

    let mut elsewhere = update_at(0.0, 0.0);
    elsewhere.map_name = "Keep".into();
    engine.apply_update(REMOTE, &elsewhere, now, &mut fx);
    assert_eq!(engine.renderable_visible(REMOTE), Some(false));
    assert!(fx.events.contains(&PresentationEvent::VisibilityChanged(REMOTE, false)));
    fx.events.clear();

    engine.tick_remote(now + TICK, TICK, "Keep", false, &mut fx);
    assert_eq!(engine.renderable_visible(REMOTE), Some(true));
    assert_eq!(fx.events, vec![PresentationEvent::VisibilityChanged(REMOTE, true)]);
}

#[test]
fn test_unknown_local_map_keeps_snapshots_visible() {
    let engine = engine();
    let now = Instant::now();
    let mut fx = Effects::new();
    let mut elsewhere = update_at(0.0, 0.0);
    elsewhere.map_name = "Keep".into();
    engine.apply_update(REMOTE, &elsewhere, now, &mut fx);
    assert_eq!(engine.renderable_visible(REMOTE), Some(true));

    for i in 1..4u32 {
        engine.tick_remote(now + TICK * i, TICK, "", false, &mut fx);
    }
    assert_eq!(engine.renderable_visible(REMOTE), Some(true));
    assert!(
        !fx.events
            .iter()
            .any(|e| matches!(e, PresentationEvent::VisibilityChanged(..)))
    );
}

// ---------------------------------------------------------------------------
// Scene transitions
// ---------------------------------------------------------------------------

#[test]
fn test_suspend_restore_round_trip_preserves_table() {
    let engine = engine();
    let now = Instant::now();
    let mut fx = Effects::new();
    let mut other = update_at(4.0, 4.0);
    other.character = Some(CharacterInfo::from(&pilot()));
    engine.apply_update(REMOTE, &update_at(1.0, 1.0), now, &mut fx);
    engine.apply_update(PeerId(30), &other, now, &mut fx);
    let before = normalized(engine.snapshots());

    let persisted = engine.suspend();
    assert!(engine.is_empty());
    assert_eq!(engine.renderable_visible(REMOTE), None);
    engine.resume();
    fx.events.clear();
    engine.restore(persisted, &mut fx);

    assert_eq!(normalized(engine.snapshots()), before);
    let created = fx
        .events
        .iter()
        .filter(|e| matches!(e, PresentationEvent::SnapshotCreated(_)))
        .count();
    assert_eq!(created, 2, "renderables recreated");
}

#[test]
fn test_restore_merges_live_position_with_persisted_identity() {
    let engine = engine();
    let now = Instant::now();
    let mut fx = Effects::new();
    let mut first = update_at(1.0, 1.0);
    first.character = Some(CharacterInfo::from(&pilot()));
    engine.apply_update(REMOTE, &first, now, &mut fx);

    let persisted = engine.suspend();
    // Fresh data arrives while unloading, without identity.
    engine.apply_update(REMOTE, &update_at(9.0, 9.0), now, &mut fx);
    assert_eq!(engine.renderable_visible(REMOTE), None, "no renderable while suspended");
    engine.resume();
    engine.restore(persisted, &mut fx);

    let merged = engine.snapshot(REMOTE).unwrap();
    assert_eq!(merged.target_position, Vec2::new(9.0, 9.0));
    assert_eq!(merged.character(), pilot());
    assert!(!merged.restored);
    assert_eq!(engine.renderable_visible(REMOTE), Some(true));
}

#[test]
fn test_suspended_updates_get_renderable_after_resume() {
    let engine = engine();
    let now = Instant::now();
    let mut fx = Effects::new();
    engine.suspend();
    engine.apply_update(REMOTE, &update_at(0.0, 0.0), now, &mut fx);
    engine.tick_remote(now, TICK, "Foyer", false, &mut fx);
    assert!(fx.events.is_empty());

    engine.resume();
    engine.tick_remote(now + TICK, TICK, "Foyer", false, &mut fx);
    assert!(matches!(fx.events[0], PresentationEvent::SnapshotCreated(_)));
}

#[test]
fn test_clear_removes_everything() {
    let engine = engine();
    let mut fx = Effects::new();
    engine.apply_update(REMOTE, &update_at(0.0, 0.0), Instant::now(), &mut fx);
    engine.clear(&mut fx);
    assert!(engine.is_empty());
    assert_eq!(removals(&fx, REMOTE), 1);
}

#[test]
fn test_snapshot_serializes_without_timing() {
    let engine = engine();
    let mut fx = Effects::new();
    let mut update = update_at(1.5, -2.0);
    update.character = Some(CharacterInfo::from(&pilot()));
    engine.apply_update(REMOTE, &update, Instant::now(), &mut fx);
    let snapshot = engine.snapshot(REMOTE).unwrap();

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["character_name"], "Pilot");
    assert_eq!(json["map_name"], "Foyer");
    assert!(json.get("last_update_time").is_none());

    let back: RemotePlayerSnapshot = serde_json::from_value(json).unwrap();
    assert_eq!(back.target_position, snapshot.target_position);
    assert_eq!(back.character(), snapshot.character());
}

#[test]
fn test_cleared_engine_ignores_late_updates() {
    let engine = engine();
    let now = Instant::now();
    let mut fx = Effects::new();
    engine.apply_update(REMOTE, &update_at(0.0, 0.0), now, &mut fx);
    let persisted = engine.snapshots();
    engine.clear(&mut fx);
    fx.events.clear();

    assert!(!engine.apply_update(REMOTE, &update_at(1.0, 0.0), now, &mut fx));
    engine.restore(persisted, &mut fx);
    assert!(engine.is_empty());
    assert!(fx.events.is_empty());

    engine.begin(LOCAL);
    assert!(engine.apply_update(REMOTE, &update_at(1.0, 0.0), now, &mut fx));
}
