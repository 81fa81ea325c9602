//! The turn engine.
//!
//! All turn mutations go through three entry points: [`apply_roll`],
//! [`apply_score`] and [`end_turn`] (with [`advance_turn`] behind it for the
//! timeout path). [`ensure_turn_state`] is the canonicalization pass that
//! runs before every read and after every mutation; calling it twice with no
//! intervening change is a no-op.

use std::collections::{HashMap, HashSet};

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::Session;

pub const MAX_TURN_ROLL_DICE: usize = 64;
pub const DIE_MIN_SIDES: u32 = 2;
pub const DIE_MAX_SIDES: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    AwaitRoll,
    AwaitScore,
    ReadyToEnd,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::AwaitRoll => "await_roll",
            TurnPhase::AwaitScore => "await_score",
            TurnPhase::ReadyToEnd => "ready_to_end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolledDie {
    pub die_id: String,
    pub sides: u32,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollSnapshot {
    pub roll_index: u32,
    pub server_roll_id: String,
    pub dice: Vec<RolledDie>,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSummary {
    pub selected_dice_ids: Vec<String>,
    pub points: u64,
    pub expected_points: u64,
    pub roll_server_id: String,
    pub projected_total_score: u64,
    pub remaining_dice: u32,
    pub is_complete: bool,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnState {
    pub order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_turn_player_id: Option<String>,
    pub round: u32,
    pub turn_number: u32,
    pub phase: TurnPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_roll_snapshot: Option<RollSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_score_summary: Option<ScoreSummary>,
    pub turn_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_expires_at: Option<u64>,
    pub updated_at: u64,
}

impl TurnState {
    pub fn new(turn_timeout_ms: u64, now: u64) -> Self {
        Self {
            order: vec![],
            active_turn_player_id: None,
            round: 1,
            turn_number: 1,
            phase: TurnPhase::AwaitRoll,
            last_roll_snapshot: None,
            last_score_summary: None,
            turn_timeout_ms,
            turn_expires_at: None,
            updated_at: now,
        }
    }

    /// The de-duplication key for scheduler fires against this turn.
    pub fn turn_key(&self) -> TurnKey {
        TurnKey {
            active_turn_player_id: self.active_turn_player_id.clone(),
            round: self.round,
            turn_number: self.turn_number,
        }
    }
}

/// Compared field by field; re-arming a timer with an identical key is a
/// no-op, a different key cancels and re-arms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnKey {
    pub active_turn_player_id: Option<String>,
    pub round: u32,
    pub turn_number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DieSpec {
    pub die_id: String,
    pub sides: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollRequest {
    #[serde(default)]
    pub roll_index: u32,
    pub dice: Vec<DieSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRequest {
    pub selected_dice_ids: Vec<String>,
    pub points: u64,
    pub roll_server_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnAdvance {
    pub previous_player_id: Option<String>,
    pub next_player_id: Option<String>,
    pub round: u32,
    pub turn_number: u32,
}

/// Produce the canonical turn state for the current participants.
///
/// Returns whether anything changed. The pass preserves prior ordering for
/// still-present participants, appends newcomers in join order, clears the
/// active player while humans are not all ready, replaces a missing or
/// completed active player, heals inconsistent phases and re-arms an elapsed
/// deadline. A completed participant stays in `order` only while the phase
/// is `ready_to_end`, so the pending `turn_end` can still name them.
pub fn ensure_turn_state(session: &mut Session, turn_timeout_ms: u64, now: u64) -> bool {
    let mut changed = false;

    if session.turn_state.is_none() {
        session.turn_state = Some(TurnState::new(turn_timeout_ms, now));
        changed = true;
    }

    let all_ready = session.humans_ready();
    let eligible: Vec<String> = session
        .participants_in_join_order()
        .into_iter()
        .filter(|p| !p.is_complete)
        .map(|p| p.player_id.clone())
        .collect();
    let complete: HashMap<String, bool> = session
        .participants
        .iter()
        .map(|(id, p)| (id.clone(), p.is_complete))
        .collect();

    let ts = session
        .turn_state
        .as_mut()
        .expect("turn state initialized above");

    let mut keep: HashSet<&str> = eligible.iter().map(|s| s.as_str()).collect();
    if ts.phase == TurnPhase::ReadyToEnd {
        if let Some(active) = ts.active_turn_player_id.as_deref() {
            if complete.get(active).copied().unwrap_or(false) {
                // Transiently keep the just-completed participant so the
                // turn_end message can carry their id.
                keep.insert(active);
            }
        }
    }

    let mut merged: Vec<String> = ts
        .order
        .iter()
        .filter(|id| keep.contains(id.as_str()))
        .cloned()
        .collect();
    for id in &eligible {
        if !merged.contains(id) {
            merged.push(id.clone());
        }
    }
    if ts.phase == TurnPhase::ReadyToEnd {
        if let Some(active) = ts.active_turn_player_id.clone() {
            if keep.contains(active.as_str()) && !merged.contains(&active) {
                merged.push(active);
            }
        }
    }

    if merged.is_empty() || !all_ready {
        if ts.active_turn_player_id.is_some()
            || ts.turn_expires_at.is_some()
            || ts.last_roll_snapshot.is_some()
            || ts.last_score_summary.is_some()
            || ts.phase != TurnPhase::AwaitRoll
        {
            ts.active_turn_player_id = None;
            ts.turn_expires_at = None;
            ts.last_roll_snapshot = None;
            ts.last_score_summary = None;
            ts.phase = TurnPhase::AwaitRoll;
            changed = true;
        }
    } else {
        let active_ok = ts.active_turn_player_id.as_deref().is_some_and(|id| {
            match complete.get(id) {
                Some(false) => true,
                // A completed active player is only valid mid ready_to_end.
                Some(true) => ts.phase == TurnPhase::ReadyToEnd,
                None => false,
            }
        });
        if !active_ok {
            ts.active_turn_player_id = Some(merged[0].clone());
            ts.phase = TurnPhase::AwaitRoll;
            ts.last_roll_snapshot = None;
            ts.last_score_summary = None;
            ts.turn_expires_at = Some(now + ts.turn_timeout_ms);
            changed = true;
        }

        match ts.phase {
            TurnPhase::AwaitScore if ts.last_roll_snapshot.is_none() => {
                ts.phase = TurnPhase::AwaitRoll;
                ts.last_score_summary = None;
                changed = true;
            }
            TurnPhase::ReadyToEnd => {
                let consistent = matches!(
                    (&ts.last_roll_snapshot, &ts.last_score_summary),
                    (Some(roll), Some(score)) if score.roll_server_id == roll.server_roll_id
                );
                if !consistent {
                    ts.phase = if ts.last_roll_snapshot.is_some() {
                        TurnPhase::AwaitScore
                    } else {
                        TurnPhase::AwaitRoll
                    };
                    ts.last_score_summary = None;
                    changed = true;
                }
            }
            _ => (),
        }

        if ts.turn_expires_at.map_or(true, |t| t <= now) {
            ts.turn_expires_at = Some(now + ts.turn_timeout_ms);
            changed = true;
        }
    }

    if ts.order != merged {
        ts.order = merged;
        changed = true;
    }
    if changed {
        ts.updated_at = now;
    }
    changed
}

/// Validate a roll request and draw the dice server-side.
pub fn apply_roll(
    session: &mut Session,
    player_id: &str,
    request: &RollRequest,
    now: u64,
) -> Result<RollSnapshot> {
    let ts = session.turn_state.as_ref().ok_or(Error::TurnNotStarted)?;
    if ts.active_turn_player_id.as_deref() != Some(player_id) {
        return Err(Error::NotYourTurn);
    }
    if ts.phase != TurnPhase::AwaitRoll {
        return Err(Error::TurnPhaseMismatch(TurnPhase::AwaitRoll.as_str().into()));
    }
    if request.dice.is_empty() {
        return Err(Error::InvalidRollPayload("no dice in payload".into()));
    }
    if request.dice.len() > MAX_TURN_ROLL_DICE {
        return Err(Error::InvalidRollPayload(format!(
            "{} dice exceeds the limit of {}",
            request.dice.len(),
            MAX_TURN_ROLL_DICE
        )));
    }

    let mut seen: HashSet<&str> = HashSet::with_capacity(request.dice.len());
    for die in &request.dice {
        if die.die_id.is_empty() || !seen.insert(die.die_id.as_str()) {
            return Err(Error::InvalidRollDieId(die.die_id.clone()));
        }
        if die.sides < DIE_MIN_SIDES || die.sides > DIE_MAX_SIDES {
            return Err(Error::InvalidRollPayload(format!(
                "die {} has {} sides",
                die.die_id, die.sides
            )));
        }
        if let Some(embedded) = embedded_sides(&die.die_id) {
            if embedded != die.sides {
                return Err(Error::RollDieSidesMismatch(die.die_id.clone()));
            }
        }
    }

    // The server owns the randomness; client-provided values never enter.
    let dice: Vec<RolledDie> = request
        .dice
        .iter()
        .map(|die| RolledDie {
            die_id: die.die_id.clone(),
            sides: die.sides,
            value: OsRng.gen_range(1..=die.sides),
        })
        .collect();

    let snapshot = RollSnapshot {
        roll_index: request.roll_index,
        server_roll_id: Uuid::new_v4().to_string(),
        dice,
        updated_at: now,
    };

    let ts = session
        .turn_state
        .as_mut()
        .expect("checked above");
    ts.last_roll_snapshot = Some(snapshot.clone());
    ts.last_score_summary = None;
    ts.phase = TurnPhase::AwaitScore;
    ts.updated_at = now;
    Ok(snapshot)
}

/// `d<N>-...` die ids embed their side count.
fn embedded_sides(die_id: &str) -> Option<u32> {
    let rest = die_id.strip_prefix('d')?;
    let (digits, _) = rest.split_once('-')?;
    digits.parse().ok()
}

/// Validate a score selection against the last roll and apply it to the
/// participant.
pub fn apply_score(
    session: &mut Session,
    player_id: &str,
    request: &ScoreRequest,
    now: u64,
) -> Result<ScoreSummary> {
    let ts = session.turn_state.as_ref().ok_or(Error::TurnNotStarted)?;
    if ts.active_turn_player_id.as_deref() != Some(player_id) {
        return Err(Error::NotYourTurn);
    }
    if ts.phase != TurnPhase::AwaitScore {
        return Err(Error::TurnPhaseMismatch(TurnPhase::AwaitScore.as_str().into()));
    }
    let snapshot = ts
        .last_roll_snapshot
        .clone()
        .ok_or(Error::ScoreRollMismatch)?;

    if request.roll_server_id != snapshot.server_roll_id {
        return Err(Error::ScoreRollMismatch);
    }
    if request.selected_dice_ids.is_empty() {
        return Err(Error::MissingSelectedDice);
    }

    let rolled: HashMap<&str, &RolledDie> = snapshot
        .dice
        .iter()
        .map(|d| (d.die_id.as_str(), d))
        .collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(request.selected_dice_ids.len());
    let mut expected: u64 = 0;
    for id in &request.selected_dice_ids {
        if !seen.insert(id.as_str()) {
            return Err(Error::DuplicatedSelectedDie(id.clone()));
        }
        let die = rolled
            .get(id.as_str())
            .ok_or_else(|| Error::SelectedDieNotRolled(id.clone()))?;
        expected += (die.sides - die.value) as u64;
    }
    if request.points != expected {
        return Err(Error::ScorePointsMismatch { expected });
    }

    let participant = session
        .participants
        .get_mut(player_id)
        .ok_or_else(|| Error::PlayerNotInSession(player_id.to_owned()))?;
    participant.score += expected;
    participant.remaining_dice = participant
        .remaining_dice
        .saturating_sub(request.selected_dice_ids.len() as u32);
    participant.is_complete = participant.remaining_dice == 0;
    if participant.is_complete && participant.completed_at.is_none() {
        participant.completed_at = Some(now);
    }

    let summary = ScoreSummary {
        selected_dice_ids: request.selected_dice_ids.clone(),
        points: expected,
        expected_points: expected,
        roll_server_id: request.roll_server_id.clone(),
        projected_total_score: participant.score,
        remaining_dice: participant.remaining_dice,
        is_complete: participant.is_complete,
        updated_at: now,
    };

    let ts = session.turn_state.as_mut().expect("checked above");
    ts.last_score_summary = Some(summary.clone());
    ts.phase = TurnPhase::ReadyToEnd;
    ts.updated_at = now;
    Ok(summary)
}

/// A player-driven turn end. Requires the `ready_to_end` phase.
pub fn end_turn(session: &mut Session, player_id: &str, now: u64) -> Result<TurnAdvance> {
    let ts = session.turn_state.as_ref().ok_or(Error::TurnNotStarted)?;
    if ts.active_turn_player_id.as_deref() != Some(player_id) {
        return Err(Error::NotYourTurn);
    }
    if ts.phase != TurnPhase::ReadyToEnd {
        return Err(Error::TurnPhaseMismatch(TurnPhase::ReadyToEnd.as_str().into()));
    }
    advance_turn(session, now)
}

/// Rotate to the next non-complete participant. Used by `end_turn` and by
/// the timeout auto-advance, which may fire in any phase.
pub fn advance_turn(session: &mut Session, now: u64) -> Result<TurnAdvance> {
    let complete: HashMap<String, bool> = session
        .participants
        .iter()
        .map(|(id, p)| (id.clone(), p.is_complete))
        .collect();
    let ts = session.turn_state.as_mut().ok_or(Error::TurnNotStarted)?;

    let previous = ts.active_turn_player_id.clone();
    let current_index = previous
        .as_ref()
        .and_then(|id| ts.order.iter().position(|o| o == id));

    let playable =
        |id: &String| -> bool { matches!(complete.get(id), Some(false)) };

    let mut next: Option<String> = None;
    let mut wrapped = false;
    if ts.order.is_empty() {
        // nothing to rotate over
    } else if let Some(ci) = current_index {
        for step in 1..=ts.order.len() {
            let idx = (ci + step) % ts.order.len();
            if playable(&ts.order[idx]) {
                next = Some(ts.order[idx].clone());
                wrapped = idx <= ci;
                break;
            }
        }
    } else {
        next = ts.order.iter().find(|id| playable(id)).cloned();
    }

    ts.last_roll_snapshot = None;
    ts.last_score_summary = None;
    ts.phase = TurnPhase::AwaitRoll;
    match &next {
        Some(id) => {
            if wrapped {
                ts.round += 1;
            }
            ts.turn_number += 1;
            ts.active_turn_player_id = Some(id.clone());
            ts.turn_expires_at = Some(now + ts.turn_timeout_ms);
        }
        None => {
            ts.active_turn_player_id = None;
            ts.turn_expires_at = None;
        }
    }
    ts.updated_at = now;

    Ok(TurnAdvance {
        previous_player_id: previous,
        next_player_id: next,
        round: ts.round,
        turn_number: ts.turn_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{GameDifficulty, Participant, RoomKind};

    const TIMEOUT: u64 = 60_000;

    fn ready_human(id: &str, joined_at: u64) -> Participant {
        let mut p = Participant::human(id, None, joined_at);
        p.is_ready = true;
        p
    }

    fn session(participants: Vec<Participant>) -> Session {
        Session {
            session_id: "s1".into(),
            room_code: "ABCDEF".into(),
            room_kind: RoomKind::Private,
            public_room_slot: None,
            game_difficulty: GameDifficulty::Normal,
            created_at: 0,
            last_activity_at: 0,
            expires_at: u64::MAX,
            participants: participants
                .into_iter()
                .map(|p| (p.player_id.clone(), p))
                .collect(),
            turn_state: None,
        }
    }

    fn roll_one_d6(session: &mut Session, player: &str, now: u64) -> RollSnapshot {
        let request = RollRequest {
            roll_index: 1,
            dice: vec![DieSpec { die_id: "d6-0".into(), sides: 6 }],
        };
        apply_roll(session, player, &request, now).unwrap()
    }

    #[test]
    fn test_ensure_assigns_first_in_join_order() {
        let mut s = session(vec![ready_human("p2", 20), ready_human("p1", 10)]);
        assert!(ensure_turn_state(&mut s, TIMEOUT, 100));
        let ts = s.turn_state.as_ref().unwrap();
        assert_eq!(ts.active_turn_player_id.as_deref(), Some("p1"));
        assert_eq!(ts.order, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(ts.turn_expires_at, Some(100 + TIMEOUT));
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let mut s = session(vec![ready_human("p1", 0), ready_human("p2", 1)]);
        assert!(ensure_turn_state(&mut s, TIMEOUT, 100));
        assert!(!ensure_turn_state(&mut s, TIMEOUT, 100));
        assert!(!ensure_turn_state(&mut s, TIMEOUT, 101));
    }

    #[test]
    fn test_ensure_clears_active_until_all_humans_ready() {
        let mut s = session(vec![ready_human("p1", 0), Participant::human("p2", None, 1)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        let ts = s.turn_state.as_ref().unwrap();
        assert_eq!(ts.active_turn_player_id, None);
        assert_eq!(ts.turn_expires_at, None);

        s.participants.get_mut("p2").unwrap().is_ready = true;
        ensure_turn_state(&mut s, TIMEOUT, 200);
        let ts = s.turn_state.as_ref().unwrap();
        assert_eq!(ts.active_turn_player_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_ensure_keeps_prior_order_and_appends_newcomers() {
        let mut s = session(vec![ready_human("p1", 0), ready_human("p2", 1)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        let newcomer = ready_human("p3", 500);
        s.participants.insert("p3".into(), newcomer);
        ensure_turn_state(&mut s, TIMEOUT, 600);
        let ts = s.turn_state.as_ref().unwrap();
        assert_eq!(ts.order, vec!["p1".to_string(), "p2".to_string(), "p3".to_string()]);
        assert_eq!(ts.active_turn_player_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_roll_rejects_bad_dice() {
        let mut s = session(vec![ready_human("p1", 0)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);

        let dup = RollRequest {
            roll_index: 1,
            dice: vec![
                DieSpec { die_id: "d6-0".into(), sides: 6 },
                DieSpec { die_id: "d6-0".into(), sides: 6 },
            ],
        };
        assert!(matches!(
            apply_roll(&mut s, "p1", &dup, 100),
            Err(Error::InvalidRollDieId(_))
        ));

        let contradiction = RollRequest {
            roll_index: 1,
            dice: vec![DieSpec { die_id: "d8-0".into(), sides: 6 }],
        };
        assert!(matches!(
            apply_roll(&mut s, "p1", &contradiction, 100),
            Err(Error::RollDieSidesMismatch(_))
        ));

        let too_many = RollRequest {
            roll_index: 1,
            dice: (0..MAX_TURN_ROLL_DICE + 1)
                .map(|i| DieSpec { die_id: format!("d6-{i}"), sides: 6 })
                .collect(),
        };
        assert!(matches!(
            apply_roll(&mut s, "p1", &too_many, 100),
            Err(Error::InvalidRollPayload(_))
        ));

        let at_limit = RollRequest {
            roll_index: 1,
            dice: (0..MAX_TURN_ROLL_DICE)
                .map(|i| DieSpec { die_id: format!("d6-{i}"), sides: 6 })
                .collect(),
        };
        assert!(apply_roll(&mut s, "p1", &at_limit, 100).is_ok());
    }

    #[test]
    fn test_roll_values_in_range_and_phase_advances() {
        let mut s = session(vec![ready_human("p1", 0)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        let snapshot = roll_one_d6(&mut s, "p1", 100);
        assert_eq!(snapshot.dice.len(), 1);
        assert!((1..=6).contains(&snapshot.dice[0].value));
        assert_eq!(
            s.turn_state.as_ref().unwrap().phase,
            TurnPhase::AwaitScore
        );
    }

    #[test]
    fn test_score_points_mismatch_reports_expected() {
        let mut s = session(vec![ready_human("p1", 0)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        let snapshot = roll_one_d6(&mut s, "p1", 100);
        let die = &snapshot.dice[0];
        let expected = (die.sides - die.value) as u64;

        let request = ScoreRequest {
            selected_dice_ids: vec!["d6-0".into()],
            points: expected + 1,
            roll_server_id: snapshot.server_roll_id.clone(),
        };
        match apply_score(&mut s, "p1", &request, 200) {
            Err(Error::ScorePointsMismatch { expected: e }) => assert_eq!(e, expected),
            other => panic!("unexpected result: {:?}", other),
        }
        // score unchanged on failure
        assert_eq!(s.participants["p1"].score, 0);
        assert_eq!(s.turn_state.as_ref().unwrap().phase, TurnPhase::AwaitScore);
    }

    #[test]
    fn test_score_rejects_stale_roll_id() {
        let mut s = session(vec![ready_human("p1", 0)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        roll_one_d6(&mut s, "p1", 100);
        let request = ScoreRequest {
            selected_dice_ids: vec!["d6-0".into()],
            points: 0,
            roll_server_id: "not-the-roll".into(),
        };
        assert!(matches!(
            apply_score(&mut s, "p1", &request, 200),
            Err(Error::ScoreRollMismatch)
        ));
    }

    #[test]
    fn test_score_applies_and_dice_monotonically_decrease() {
        let mut s = session(vec![ready_human("p1", 0)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        let snapshot = roll_one_d6(&mut s, "p1", 100);
        let die = &snapshot.dice[0];
        let expected = (die.sides - die.value) as u64;
        let request = ScoreRequest {
            selected_dice_ids: vec!["d6-0".into()],
            points: expected,
            roll_server_id: snapshot.server_roll_id.clone(),
        };
        let summary = apply_score(&mut s, "p1", &request, 200).unwrap();
        assert_eq!(summary.points, expected);
        assert_eq!(summary.remaining_dice, 14);
        let p = &s.participants["p1"];
        assert_eq!(p.score, expected);
        assert_eq!(p.remaining_dice, 14);
        assert!(!p.is_complete);
        assert_eq!(s.turn_state.as_ref().unwrap().phase, TurnPhase::ReadyToEnd);
    }

    #[test]
    fn test_solo_end_turn_wraps_round_and_increments_turn() {
        let mut s = session(vec![ready_human("p1", 0)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        let snapshot = roll_one_d6(&mut s, "p1", 100);
        let die = &snapshot.dice[0];
        let request = ScoreRequest {
            selected_dice_ids: vec!["d6-0".into()],
            points: (die.sides - die.value) as u64,
            roll_server_id: snapshot.server_roll_id.clone(),
        };
        apply_score(&mut s, "p1", &request, 200).unwrap();
        let advance = end_turn(&mut s, "p1", 300).unwrap();
        assert_eq!(advance.previous_player_id.as_deref(), Some("p1"));
        assert_eq!(advance.next_player_id.as_deref(), Some("p1"));
        assert_eq!(advance.round, 2);
        assert_eq!(advance.turn_number, 2);
        assert_eq!(s.turn_state.as_ref().unwrap().phase, TurnPhase::AwaitRoll);
    }

    #[test]
    fn test_rotation_skips_completed_participants() {
        let mut s = session(vec![
            ready_human("p1", 0),
            ready_human("p2", 1),
            ready_human("p3", 2),
        ]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        {
            let p2 = s.participants.get_mut("p2").unwrap();
            p2.remaining_dice = 0;
            p2.is_complete = true;
            p2.completed_at = Some(50);
        }
        let advance = advance_turn(&mut s, 200).unwrap();
        assert_eq!(advance.next_player_id.as_deref(), Some("p3"));
    }

    #[test]
    fn test_no_playable_participant_ends_the_game() {
        let mut s = session(vec![ready_human("p1", 0)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        {
            let p1 = s.participants.get_mut("p1").unwrap();
            p1.remaining_dice = 0;
            p1.is_complete = true;
            p1.completed_at = Some(150);
        }
        let advance = advance_turn(&mut s, 200).unwrap();
        assert_eq!(advance.next_player_id, None);
        let ts = s.turn_state.as_ref().unwrap();
        assert_eq!(ts.active_turn_player_id, None);
        assert_eq!(ts.turn_expires_at, None);
    }

    #[test]
    fn test_completed_active_survives_ready_to_end_then_pruned() {
        let mut s = session(vec![ready_human("p1", 0), ready_human("p2", 1)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        // p1 scores their last die
        {
            let p1 = s.participants.get_mut("p1").unwrap();
            p1.remaining_dice = 1;
        }
        ensure_turn_state(&mut s, TIMEOUT, 100);
        let snapshot = roll_one_d6(&mut s, "p1", 100);
        let die = &snapshot.dice[0];
        let request = ScoreRequest {
            selected_dice_ids: vec!["d6-0".into()],
            points: (die.sides - die.value) as u64,
            roll_server_id: snapshot.server_roll_id.clone(),
        };
        apply_score(&mut s, "p1", &request, 200).unwrap();
        assert!(s.participants["p1"].is_complete);

        // The completed active player stays in order during ready_to_end.
        ensure_turn_state(&mut s, TIMEOUT, 250);
        let ts = s.turn_state.as_ref().unwrap();
        assert_eq!(ts.phase, TurnPhase::ReadyToEnd);
        assert!(ts.order.contains(&"p1".to_string()));
        assert_eq!(ts.active_turn_player_id.as_deref(), Some("p1"));

        end_turn(&mut s, "p1", 300).unwrap();
        ensure_turn_state(&mut s, TIMEOUT, 300);
        let ts = s.turn_state.as_ref().unwrap();
        assert_eq!(ts.active_turn_player_id.as_deref(), Some("p2"));
        assert!(!ts.order.contains(&"p1".to_string()));
    }

    #[test]
    fn test_phase_healing() {
        let mut s = session(vec![ready_human("p1", 0)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        {
            let ts = s.turn_state.as_mut().unwrap();
            ts.phase = TurnPhase::AwaitScore;
            ts.last_roll_snapshot = None;
        }
        ensure_turn_state(&mut s, TIMEOUT, 200);
        assert_eq!(s.turn_state.as_ref().unwrap().phase, TurnPhase::AwaitRoll);

        // ready_to_end with a score bound to a different roll heals back
        let snapshot = roll_one_d6(&mut s, "p1", 300);
        {
            let ts = s.turn_state.as_mut().unwrap();
            ts.phase = TurnPhase::ReadyToEnd;
            ts.last_score_summary = Some(ScoreSummary {
                selected_dice_ids: vec!["d6-0".into()],
                points: 1,
                expected_points: 1,
                roll_server_id: "stale".into(),
                projected_total_score: 1,
                remaining_dice: 14,
                is_complete: false,
                updated_at: 300,
            });
        }
        ensure_turn_state(&mut s, TIMEOUT, 400);
        let ts = s.turn_state.as_ref().unwrap();
        assert_eq!(ts.phase, TurnPhase::AwaitScore);
        assert_eq!(
            ts.last_roll_snapshot.as_ref().unwrap().server_roll_id,
            snapshot.server_roll_id
        );
        assert_eq!(ts.last_score_summary, None);
    }

    #[test]
    fn test_elapsed_deadline_is_rearmed() {
        let mut s = session(vec![ready_human("p1", 0)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        let first = s.turn_state.as_ref().unwrap().turn_expires_at.unwrap();
        ensure_turn_state(&mut s, TIMEOUT, first + 5);
        let second = s.turn_state.as_ref().unwrap().turn_expires_at.unwrap();
        assert_eq!(second, first + 5 + TIMEOUT);
    }

    #[test]
    fn test_turn_key_equality() {
        let mut s = session(vec![ready_human("p1", 0), ready_human("p2", 1)]);
        ensure_turn_state(&mut s, TIMEOUT, 100);
        let k1 = s.turn_state.as_ref().unwrap().turn_key();
        ensure_turn_state(&mut s, TIMEOUT, 101);
        let k2 = s.turn_state.as_ref().unwrap().turn_key();
        assert_eq!(k1, k2);
        advance_turn(&mut s, 200).unwrap();
        let k3 = s.turn_state.as_ref().unwrap().turn_key();
        assert_ne!(k1, k3);
    }
}
