//! The room catalog.
//!
//! Pure functions over the shared [`Snapshot`]; the application context
//! owns the lock and calls in. Socket connectivity comes in as a snapshot
//! taken from the fan-out hub before the state lock is acquired.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use tracing::{debug, info};
use uuid::Uuid;

use tumble_core::error::{Error, Result};
use tumble_core::params::{CreateSessionParams, JoinSessionParams, RoomSummary};
use tumble_core::session::{
    GameDifficulty, Participant, RoomKind, Session, MAX_MULTIPLAYER_BOTS, ROOM_CODE_MAX_LEN,
};
use tumble_core::state::Snapshot;
use tumble_core::turn::ensure_turn_state;
use tumble_env::Config;

use crate::bots;

pub const DEFAULT_ROOM_LIST_LIMIT: usize = 24;
pub const MAX_ROOM_LIST_LIMIT: usize = 100;

const ROOM_CODE_LEN: usize = 6;
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_ATTEMPTS: usize = 24;

/// Which players hold an open socket, per session.
pub type ConnectedMap = HashMap<String, HashSet<String>>;

/// Room limits and TTLs, fixed at boot from the config.
#[derive(Debug, Clone)]
pub struct RoomPolicy {
    pub session_idle_ttl_ms: u64,
    pub active_window_ms: u64,
    pub max_human_players: u32,
    pub public_room_base_count: u32,
    pub public_room_min_joinable: usize,
    pub overflow_empty_ttl_ms: u64,
    pub stale_participant_ms: u64,
    pub code_prefix: String,
    pub turn_timeout_ms: u64,
}

impl RoomPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session_idle_ttl_ms: config.rooms.session_idle_ttl_ms,
            active_window_ms: config.rooms.active_window_ms,
            max_human_players: config.rooms.max_human_players,
            public_room_base_count: config.rooms.public_room_base_count,
            public_room_min_joinable: config.rooms.public_room_min_joinable,
            overflow_empty_ttl_ms: config.rooms.public_room_overflow_empty_ttl_ms,
            stale_participant_ms: config.rooms.public_room_stale_participant_ms,
            code_prefix: config.rooms.public_room_code_prefix.clone(),
            turn_timeout_ms: config.turns.turn_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeaveOutcome {
    /// Participant removed, the session keeps running.
    Left,
    /// Last human left a private room; the session is gone.
    SessionRemoved,
    /// Last human left a public room; it was reset in place.
    SessionReset,
}

fn live_code_in_use(snapshot: &Snapshot, code: &str) -> bool {
    snapshot
        .multiplayer_sessions
        .values()
        .any(|s| s.room_code == code)
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| *ROOM_CODE_ALPHABET.choose(&mut rng).expect("alphabet") as char)
        .collect()
}

/// A free room code. Random, with a deterministic fallback once the odds
/// stop cooperating.
fn generate_room_code(snapshot: &Snapshot) -> String {
    for _ in 0..CODE_ATTEMPTS {
        let code = random_code();
        if !live_code_in_use(snapshot, &code) {
            return code;
        }
    }
    let fallback: String = Uuid::new_v4()
        .simple()
        .to_string()
        .to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(ROOM_CODE_LEN)
        .collect();
    fallback
}

/// Create a private session seeded with the creator and a bot lineup.
pub fn create_session(
    snapshot: &mut Snapshot,
    policy: &RoomPolicy,
    params: &CreateSessionParams,
    now: u64,
) -> Result<String> {
    if params.player_id.trim().is_empty() {
        return Err(Error::InvalidParams("playerId is required".into()));
    }

    let room_code = match &params.room_code {
        Some(requested) => {
            let code = requested.trim().to_uppercase();
            if code.is_empty() || code.len() > ROOM_CODE_MAX_LEN {
                return Err(Error::InvalidParams("invalid room code".into()));
            }
            if live_code_in_use(snapshot, &code) {
                return Err(Error::RoomCodeTaken);
            }
            code
        }
        None => generate_room_code(snapshot),
    };

    let session_id = Uuid::new_v4().to_string();
    let mut session = Session {
        session_id: session_id.clone(),
        room_code,
        room_kind: RoomKind::Private,
        public_room_slot: None,
        game_difficulty: params.game_difficulty.unwrap_or_default(),
        created_at: now,
        last_activity_at: now,
        expires_at: now + policy.session_idle_ttl_ms,
        participants: HashMap::new(),
        turn_state: None,
    };

    let bot_count = params
        .bot_count
        .unwrap_or(MAX_MULTIPLAYER_BOTS)
        .min(MAX_MULTIPLAYER_BOTS);
    bots::seed_bots(&mut session, bot_count, now);

    let creator = Participant::human(&params.player_id, params.display_name.clone(), now);
    session
        .participants
        .insert(params.player_id.clone(), creator);

    ensure_turn_state(&mut session, policy.turn_timeout_ms, now);
    info!(
        "Created session {} with code {} and {} bots",
        session_id, session.room_code, bot_count
    );
    snapshot
        .multiplayer_sessions
        .insert(session_id.clone(), session);
    Ok(session_id)
}

/// Join (or rejoin) a session by id. Rejoining preserves progress and does
/// not count against the human cap.
pub fn join_session(
    snapshot: &mut Snapshot,
    policy: &RoomPolicy,
    session_id: &str,
    params: &JoinSessionParams,
    now: u64,
) -> Result<()> {
    if params.player_id.trim().is_empty() {
        return Err(Error::InvalidParams("playerId is required".into()));
    }
    let session = snapshot
        .multiplayer_sessions
        .get_mut(session_id)
        .ok_or(Error::SessionNotFound)?;
    if session.is_expired(now) {
        return Err(Error::SessionExpired);
    }

    let returning = session.participants.contains_key(&params.player_id);
    if !returning && session.human_count() >= policy.max_human_players as usize {
        return Err(Error::RoomFull(policy.max_human_players));
    }

    match session.participants.get_mut(&params.player_id) {
        Some(existing) => {
            // keep joinedAt, score and dice; the rejoin only refreshes liveness
            existing.last_heartbeat_at = now;
            existing.is_ready = false;
            if params.display_name.is_some() {
                existing.display_name = params.display_name.clone();
            }
        }
        None => {
            let participant =
                Participant::human(&params.player_id, params.display_name.clone(), now);
            session
                .participants
                .insert(params.player_id.clone(), participant);
        }
    }

    session.touch(policy.session_idle_ttl_ms, now);
    ensure_turn_state(session, policy.turn_timeout_ms, now);
    Ok(())
}

/// Resolve a room code to a live session id. Private beats overflow beats
/// default; ties go to the most recently active room.
pub fn resolve_room_code(snapshot: &Snapshot, code: &str, now: u64) -> Result<String> {
    let code = code.trim().to_uppercase();
    let mut candidates: Vec<&Session> = snapshot
        .multiplayer_sessions
        .values()
        .filter(|s| s.room_code == code && !s.is_expired(now))
        .collect();
    if candidates.is_empty() {
        return Err(Error::RoomNotFound);
    }
    candidates.sort_by(|a, b| {
        a.room_kind
            .priority()
            .cmp(&b.room_kind.priority())
            .then_with(|| b.last_activity_at.cmp(&a.last_activity_at))
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
    Ok(candidates[0].session_id.clone())
}

/// Remove a participant. Empty private rooms die; empty public rooms are
/// reset in place.
pub fn leave_session(
    snapshot: &mut Snapshot,
    policy: &RoomPolicy,
    session_id: &str,
    player_id: &str,
    now: u64,
) -> Result<LeaveOutcome> {
    let session = snapshot
        .multiplayer_sessions
        .get_mut(session_id)
        .ok_or(Error::SessionNotFound)?;
    if session.participants.remove(player_id).is_none() {
        return Err(Error::PlayerNotInSession(player_id.to_owned()));
    }

    if session.human_count() == 0 {
        if session.room_kind == RoomKind::Private {
            info!("Last human left private session {}, removing", session_id);
            snapshot.multiplayer_sessions.remove(session_id);
            return Ok(LeaveOutcome::SessionRemoved);
        }
        reset_in_place(session, policy, now);
        return Ok(LeaveOutcome::SessionReset);
    }

    session.touch(policy.session_idle_ttl_ms, now);
    ensure_turn_state(session, policy.turn_timeout_ms, now);
    Ok(LeaveOutcome::Left)
}

pub fn heartbeat(
    snapshot: &mut Snapshot,
    policy: &RoomPolicy,
    session_id: &str,
    player_id: &str,
    now: u64,
) -> Result<()> {
    let session = snapshot
        .multiplayer_sessions
        .get_mut(session_id)
        .ok_or(Error::SessionNotFound)?;
    if session.is_expired(now) {
        return Err(Error::SessionExpired);
    }
    let participant = session
        .participants
        .get_mut(player_id)
        .ok_or_else(|| Error::PlayerNotInSession(player_id.to_owned()))?;
    participant.last_heartbeat_at = now;
    session.touch(policy.session_idle_ttl_ms, now);
    Ok(())
}

fn reset_in_place(session: &mut Session, policy: &RoomPolicy, now: u64) {
    debug!("Resetting public session {} in place", session.session_id);
    session.participants.clear();
    session.turn_state = None;
    session.last_activity_at = now;
    session.expires_at = now
        + match session.room_kind {
            RoomKind::PublicOverflow => policy.overflow_empty_ttl_ms,
            _ => policy.session_idle_ttl_ms,
        };
}

fn is_joinable(session: &Session, policy: &RoomPolicy, now: u64) -> bool {
    session.room_kind.is_public()
        && !session.is_expired(now)
        && !session.is_game_complete()
        && session.human_count() < policy.max_human_players as usize
}

fn default_slot_code(policy: &RoomPolicy, slot: u32) -> String {
    format!("{}{}", policy.code_prefix, slot + 1)
}

fn new_public_session(
    policy: &RoomPolicy,
    code: String,
    kind: RoomKind,
    slot: Option<u32>,
    now: u64,
) -> Session {
    let ttl = match kind {
        RoomKind::PublicOverflow => policy.overflow_empty_ttl_ms,
        _ => policy.session_idle_ttl_ms,
    };
    Session {
        session_id: Uuid::new_v4().to_string(),
        room_code: code,
        room_kind: kind,
        public_room_slot: slot,
        game_difficulty: GameDifficulty::Normal,
        created_at: now,
        last_activity_at: now,
        expires_at: now + ttl,
        participants: HashMap::new(),
        turn_state: None,
    }
}

/// Restore the public-room inventory invariants. Idempotent; runs on boot,
/// on listing, after joins and leaves and from the periodic cleanup.
pub fn reconcile_public_rooms(
    snapshot: &mut Snapshot,
    policy: &RoomPolicy,
    connected: &ConnectedMap,
    now: u64,
) -> bool {
    let mut changed = false;

    // Prune public-room humans that are neither connected nor heartbeating.
    for session in snapshot.multiplayer_sessions.values_mut() {
        if !session.room_kind.is_public() {
            continue;
        }
        let empty = HashSet::new();
        let live = connected.get(&session.session_id).unwrap_or(&empty);
        let before = session.participants.len();
        session.participants.retain(|id, p| {
            p.is_bot
                || live.contains(id)
                || p.last_heartbeat_at + policy.stale_participant_ms > now
        });
        if session.participants.len() != before {
            debug!(
                "Pruned {} stale participants from {}",
                before - session.participants.len(),
                session.session_id
            );
            ensure_turn_state(session, policy.turn_timeout_ms, now);
            changed = true;
        }
    }

    // Demote defaults with a bad, duplicate or out-of-range slot.
    let mut claimed: HashMap<u32, String> = HashMap::new();
    let mut demote: Vec<String> = vec![];
    let mut default_ids: Vec<String> = snapshot
        .multiplayer_sessions
        .values()
        .filter(|s| s.room_kind == RoomKind::PublicDefault)
        .map(|s| s.session_id.clone())
        .collect();
    default_ids.sort_by_key(|id| snapshot.multiplayer_sessions[id].created_at);
    for id in default_ids {
        let session = &snapshot.multiplayer_sessions[&id];
        match session.public_room_slot {
            Some(slot) if slot < policy.public_room_base_count => {
                if claimed.contains_key(&slot) {
                    demote.push(id);
                } else {
                    claimed.insert(slot, id);
                }
            }
            _ => demote.push(id),
        }
    }
    for id in demote {
        if let Some(session) = snapshot.multiplayer_sessions.get_mut(&id) {
            info!("Demoting stale default room {} to overflow", id);
            session.room_kind = RoomKind::PublicOverflow;
            session.public_room_slot = None;
            changed = true;
        }
    }

    // Fill every unclaimed slot with a deterministic lobby.
    for slot in 0..policy.public_room_base_count {
        if claimed.contains_key(&slot) {
            continue;
        }
        let code = default_slot_code(policy, slot);
        let session = new_public_session(policy, code, RoomKind::PublicDefault, Some(slot), now);
        info!(
            "Created default room {} at slot {}",
            session.room_code, slot
        );
        snapshot
            .multiplayer_sessions
            .insert(session.session_id.clone(), session);
        changed = true;
    }

    // Top up overflow rooms until enough public rooms are joinable.
    loop {
        let joinable = snapshot
            .multiplayer_sessions
            .values()
            .filter(|s| is_joinable(s, policy, now))
            .count();
        if joinable >= policy.public_room_min_joinable {
            break;
        }
        let code = generate_room_code(snapshot);
        let session = new_public_session(policy, code, RoomKind::PublicOverflow, None, now);
        info!("Created overflow room {}", session.room_code);
        snapshot
            .multiplayer_sessions
            .insert(session.session_id.clone(), session);
        changed = true;
    }

    changed
}

/// Joinable public rooms, best candidates first.
pub fn list_rooms(
    snapshot: &mut Snapshot,
    policy: &RoomPolicy,
    connected: &ConnectedMap,
    limit: Option<usize>,
    now: u64,
) -> Vec<RoomSummary> {
    reconcile_public_rooms(snapshot, policy, connected, now);

    let limit = limit
        .unwrap_or(DEFAULT_ROOM_LIST_LIMIT)
        .min(MAX_ROOM_LIST_LIMIT);
    let mut rooms: Vec<&Session> = snapshot
        .multiplayer_sessions
        .values()
        .filter(|s| is_joinable(s, policy, now))
        .collect();
    rooms.sort_by(|a, b| {
        list_priority(a)
            .cmp(&list_priority(b))
            .then_with(|| {
                b.active_human_count(policy.active_window_ms, now)
                    .cmp(&a.active_human_count(policy.active_window_ms, now))
            })
            .then_with(|| b.human_count().cmp(&a.human_count()))
            .then_with(|| b.last_activity_at.cmp(&a.last_activity_at))
    });
    rooms
        .into_iter()
        .take(limit)
        .map(|s| RoomSummary {
            session_id: s.session_id.clone(),
            room_code: s.room_code.clone(),
            room_kind: s.room_kind,
            game_difficulty: s.game_difficulty,
            human_count: s.human_count(),
            active_human_count: s.active_human_count(policy.active_window_ms, now),
            bot_count: s.bot_count(),
            last_activity_at: s.last_activity_at,
        })
        .collect()
}

fn list_priority(session: &Session) -> u8 {
    match session.room_kind {
        RoomKind::PublicDefault => 0,
        RoomKind::PublicOverflow => 1,
        RoomKind::Private => 2,
    }
}

/// Expire sessions and restore inventory. Returns the ids of removed
/// sessions so their sockets and timers can be torn down.
pub fn cleanup(
    snapshot: &mut Snapshot,
    policy: &RoomPolicy,
    connected: &ConnectedMap,
    now: u64,
) -> Vec<String> {
    let expired: Vec<String> = snapshot
        .multiplayer_sessions
        .values()
        .filter(|s| s.is_expired(now))
        .map(|s| s.session_id.clone())
        .collect();

    let mut removed = vec![];
    for id in expired {
        let Some(session) = snapshot.multiplayer_sessions.get_mut(&id) else {
            continue;
        };
        if session.room_kind == RoomKind::PublicDefault {
            reset_in_place(session, policy, now);
        } else {
            info!("Expiring session {} ({})", id, session.room_code);
            snapshot.multiplayer_sessions.remove(&id);
            removed.push(id);
        }
    }

    reconcile_public_rooms(snapshot, policy, connected, now);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tumble_core::params::CreateSessionParams;

    fn policy() -> RoomPolicy {
        RoomPolicy {
            session_idle_ttl_ms: 30 * 60 * 1000,
            active_window_ms: 5 * 60 * 1000,
            max_human_players: 8,
            public_room_base_count: 3,
            public_room_min_joinable: 6,
            overflow_empty_ttl_ms: 10 * 60 * 1000,
            stale_participant_ms: 2 * 60 * 1000,
            code_prefix: "LBY".into(),
            turn_timeout_ms: 60_000,
        }
    }

    fn create_params(player_id: &str) -> CreateSessionParams {
        CreateSessionParams {
            player_id: player_id.into(),
            display_name: None,
            room_code: None,
            game_difficulty: None,
            bot_count: Some(0),
        }
    }

    fn join_params(player_id: &str) -> JoinSessionParams {
        JoinSessionParams {
            player_id: player_id.into(),
            display_name: None,
        }
    }

    #[test]
    fn test_create_session_seeds_creator_and_bots() {
        let mut snapshot = Snapshot::new();
        let params = CreateSessionParams {
            bot_count: Some(9),
            ..create_params("p1")
        };
        let id = create_session(&mut snapshot, &policy(), &params, 1000).unwrap();
        let session = &snapshot.multiplayer_sessions[&id];
        assert_eq!(session.human_count(), 1);
        assert_eq!(session.bot_count(), MAX_MULTIPLAYER_BOTS);
        assert_eq!(session.room_code.len(), 6);
        assert!(session
            .participants
            .values()
            .all(|p| p.remaining_dice == 15));
    }

    #[test]
    fn test_requested_room_code_conflict() {
        let mut snapshot = Snapshot::new();
        let params = CreateSessionParams {
            room_code: Some("duel42".into()),
            ..create_params("p1")
        };
        let id = create_session(&mut snapshot, &policy(), &params, 1000).unwrap();
        assert_eq!(snapshot.multiplayer_sessions[&id].room_code, "DUEL42");

        let clash = CreateSessionParams {
            room_code: Some("DUEL42".into()),
            ..create_params("p2")
        };
        assert!(matches!(
            create_session(&mut snapshot, &policy(), &clash, 2000),
            Err(Error::RoomCodeTaken)
        ));
    }

    #[test]
    fn test_room_full_and_returning_player() {
        let mut snapshot = Snapshot::new();
        let policy = policy();
        let id = create_session(&mut snapshot, &policy, &create_params("p1"), 1000).unwrap();
        for i in 2..=8 {
            join_session(&mut snapshot, &policy, &id, &join_params(&format!("p{i}")), 1000)
                .unwrap();
        }
        assert_eq!(snapshot.multiplayer_sessions[&id].human_count(), 8);

        assert!(matches!(
            join_session(&mut snapshot, &policy, &id, &join_params("p9"), 2000),
            Err(Error::RoomFull(8))
        ));
        // a player already in the set does not count against the cap
        join_session(&mut snapshot, &policy, &id, &join_params("p8"), 2000).unwrap();
    }

    #[test]
    fn test_rejoin_preserves_progress() {
        let mut snapshot = Snapshot::new();
        let policy = policy();
        let id = create_session(&mut snapshot, &policy, &create_params("p1"), 1000).unwrap();
        {
            let session = snapshot.multiplayer_sessions.get_mut(&id).unwrap();
            let p1 = session.participants.get_mut("p1").unwrap();
            p1.score = 12;
            p1.remaining_dice = 7;
        }
        join_session(&mut snapshot, &policy, &id, &join_params("p1"), 5000).unwrap();
        let p1 = &snapshot.multiplayer_sessions[&id].participants["p1"];
        assert_eq!(p1.score, 12);
        assert_eq!(p1.remaining_dice, 7);
        assert_eq!(p1.joined_at, 1000);
        assert!(!p1.is_ready);
    }

    #[test]
    fn test_join_expired_session() {
        let mut snapshot = Snapshot::new();
        let policy = policy();
        let id = create_session(&mut snapshot, &policy, &create_params("p1"), 1000).unwrap();
        let expires_at = snapshot.multiplayer_sessions[&id].expires_at;
        assert!(matches!(
            join_session(&mut snapshot, &policy, &id, &join_params("p2"), expires_at + 1),
            Err(Error::SessionExpired)
        ));
    }

    #[test]
    fn test_leave_private_room_removes_session() {
        let mut snapshot = Snapshot::new();
        let policy = policy();
        let id = create_session(&mut snapshot, &policy, &create_params("p1"), 1000).unwrap();
        let outcome = leave_session(&mut snapshot, &policy, &id, "p1", 2000).unwrap();
        assert_eq!(outcome, LeaveOutcome::SessionRemoved);
        assert!(!snapshot.multiplayer_sessions.contains_key(&id));
    }

    #[test]
    fn test_reconcile_creates_inventory_from_empty() {
        let mut snapshot = Snapshot::new();
        let policy = policy();
        let connected = ConnectedMap::new();
        assert!(reconcile_public_rooms(&mut snapshot, &policy, &connected, 1000));

        let defaults: Vec<&Session> = snapshot
            .multiplayer_sessions
            .values()
            .filter(|s| s.room_kind == RoomKind::PublicDefault)
            .collect();
        assert_eq!(defaults.len(), 3);
        let mut codes: Vec<&str> = defaults.iter().map(|s| s.room_code.as_str()).collect();
        codes.sort();
        assert_eq!(codes, vec!["LBY1", "LBY2", "LBY3"]);

        let joinable = snapshot
            .multiplayer_sessions
            .values()
            .filter(|s| is_joinable(s, &policy, 1000))
            .count();
        assert!(joinable >= policy.public_room_min_joinable);

        // the pass is idempotent
        assert!(!reconcile_public_rooms(&mut snapshot, &policy, &connected, 1000));
    }

    #[test]
    fn test_reconcile_demotes_duplicate_slots() {
        let mut snapshot = Snapshot::new();
        let policy = policy();
        let connected = ConnectedMap::new();
        reconcile_public_rooms(&mut snapshot, &policy, &connected, 1000);

        // clone slot 0 into a later session
        let dup = new_public_session(
            &policy,
            "LBYX".into(),
            RoomKind::PublicDefault,
            Some(0),
            2000,
        );
        let dup_id = dup.session_id.clone();
        snapshot.multiplayer_sessions.insert(dup_id.clone(), dup);

        reconcile_public_rooms(&mut snapshot, &policy, &connected, 3000);
        assert_eq!(
            snapshot.multiplayer_sessions[&dup_id].room_kind,
            RoomKind::PublicOverflow
        );
        let slot0_count = snapshot
            .multiplayer_sessions
            .values()
            .filter(|s| s.room_kind == RoomKind::PublicDefault && s.public_room_slot == Some(0))
            .count();
        assert_eq!(slot0_count, 1);
    }

    #[test]
    fn test_reconcile_prunes_stale_public_participants() {
        let mut snapshot = Snapshot::new();
        let policy = policy();
        let connected = ConnectedMap::new();
        reconcile_public_rooms(&mut snapshot, &policy, &connected, 1000);

        let lobby_id = snapshot
            .multiplayer_sessions
            .values()
            .find(|s| s.room_kind == RoomKind::PublicDefault)
            .unwrap()
            .session_id
            .clone();
        join_session(&mut snapshot, &policy, &lobby_id, &join_params("ghost"), 1000).unwrap();

        // not connected, heartbeat long gone
        let later = 1000 + policy.stale_participant_ms + 1;
        reconcile_public_rooms(&mut snapshot, &policy, &connected, later);
        assert!(!snapshot.multiplayer_sessions[&lobby_id]
            .participants
            .contains_key("ghost"));

        // a connected player survives without heartbeats
        join_session(&mut snapshot, &policy, &lobby_id, &join_params("live"), later).unwrap();
        let mut live_set = HashSet::new();
        live_set.insert("live".to_string());
        let mut connected = ConnectedMap::new();
        connected.insert(lobby_id.clone(), live_set);
        let much_later = later + policy.stale_participant_ms * 3;
        reconcile_public_rooms(&mut snapshot, &policy, &connected, much_later);
        assert!(snapshot.multiplayer_sessions[&lobby_id]
            .participants
            .contains_key("live"));
    }

    #[test]
    fn test_resolve_room_code_priority() {
        let mut snapshot = Snapshot::new();
        let policy = policy();

        // an overflow room and a private room with the same code
        let overflow =
            new_public_session(&policy, "SHARED".into(), RoomKind::PublicOverflow, None, 1000);
        let overflow_id = overflow.session_id.clone();
        snapshot
            .multiplayer_sessions
            .insert(overflow_id.clone(), overflow);

        let params = CreateSessionParams {
            room_code: None,
            ..create_params("p1")
        };
        let private_id = create_session(&mut snapshot, &policy, &params, 2000).unwrap();
        snapshot
            .multiplayer_sessions
            .get_mut(&private_id)
            .unwrap()
            .room_code = "SHARED".into();

        let resolved = resolve_room_code(&snapshot, "shared", 3000).unwrap();
        assert_eq!(resolved, private_id);

        assert!(matches!(
            resolve_room_code(&snapshot, "NOPE", 3000),
            Err(Error::RoomNotFound)
        ));
    }

    #[test]
    fn test_cleanup_expires_and_resets() {
        let mut snapshot = Snapshot::new();
        let policy = policy();
        let connected = ConnectedMap::new();
        reconcile_public_rooms(&mut snapshot, &policy, &connected, 1000);
        let private_id =
            create_session(&mut snapshot, &policy, &create_params("p1"), 1000).unwrap();

        let default_id = snapshot
            .multiplayer_sessions
            .values()
            .find(|s| s.room_kind == RoomKind::PublicDefault)
            .unwrap()
            .session_id
            .clone();

        let long_after = 1000 + policy.session_idle_ttl_ms + 1;
        let removed = cleanup(&mut snapshot, &policy, &connected, long_after);
        assert!(removed.contains(&private_id));
        // defaults survive by resetting in place
        assert!(snapshot.multiplayer_sessions.contains_key(&default_id));
        let defaults = snapshot
            .multiplayer_sessions
            .values()
            .filter(|s| s.room_kind == RoomKind::PublicDefault)
            .count();
        assert_eq!(defaults, 3);
    }

    #[test]
    fn test_list_rooms_orders_defaults_first() {
        let mut snapshot = Snapshot::new();
        let policy = policy();
        let connected = ConnectedMap::new();
        reconcile_public_rooms(&mut snapshot, &policy, &connected, 1000);

        let rooms = list_rooms(&mut snapshot, &policy, &connected, None, 1000);
        assert!(rooms.len() >= policy.public_room_min_joinable);
        assert_eq!(rooms[0].room_kind, RoomKind::PublicDefault);

        let clipped = list_rooms(&mut snapshot, &policy, &connected, Some(2), 1000);
        assert_eq!(clipped.len(), 2);
    }
}
