//! Bot participants: the fixed roster, turn pacing, scoring bias and the
//! flavor chatter they produce between turns.

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Map, Value};

use tumble_core::error::Result;
use tumble_core::session::{BotProfile, GameDifficulty, Participant, Session};
use tumble_core::turn::{
    self, DieSpec, RollRequest, RollSnapshot, ScoreRequest, ScoreSummary, TurnAdvance,
};

/// Name + profile rotation used when seeding a room.
pub const BOT_ROSTER: &[(&str, BotProfile)] = &[
    ("Rattlebones", BotProfile::Cautious),
    ("Lady Tumble", BotProfile::Balanced),
    ("Hexpip", BotProfile::Aggressive),
    ("Old Snake Eyes", BotProfile::Cautious),
    ("Marble Max", BotProfile::Balanced),
    ("Pipsqueak", BotProfile::Aggressive),
    ("The Banker", BotProfile::Balanced),
    ("Greta Gamble", BotProfile::Aggressive),
];

const BOT_DICE_PER_ROLL: u32 = 5;

/// Seed up to `count` bots into a freshly created session.
pub fn seed_bots(session: &mut Session, count: usize, now: u64) {
    for (index, (name, profile)) in BOT_ROSTER.iter().cycle().take(count).enumerate() {
        let player_id = format!("bot-{}-{}", session.session_id, index + 1);
        // Stagger joined_at so bots keep a stable turn order.
        let participant = Participant::bot(&player_id, name, *profile, now + index as u64 + 1);
        session.participants.insert(player_id, participant);
    }
}

/// Delay before a bot takes its turn, in milliseconds.
pub fn turn_delay_ms(profile: BotProfile, difficulty: GameDifficulty) -> u64 {
    let (low, high) = match profile {
        BotProfile::Cautious => (2300u64, 4200u64),
        BotProfile::Balanced => (1500, 3200),
        BotProfile::Aggressive => (900, 2200),
    };
    let base = rand::thread_rng().gen_range(low..=high);
    match difficulty {
        GameDifficulty::Easy => base * 5 / 4,
        GameDifficulty::Normal => base,
        GameDifficulty::Hard => base * 4 / 5,
    }
}

/// Interval between flavor messages, in milliseconds.
pub fn flavor_delay_ms() -> u64 {
    rand::thread_rng().gen_range(4500..=9000)
}

pub struct BotTurnOutcome {
    pub roll: RollSnapshot,
    pub score: ScoreSummary,
    pub advance: TurnAdvance,
}

/// Run a complete bot turn: roll, pick dice per profile, score, end.
pub fn take_turn(session: &mut Session, bot_id: &str, now: u64) -> Result<BotTurnOutcome> {
    let (profile, remaining) = {
        let participant = session
            .participants
            .get(bot_id)
            .ok_or_else(|| tumble_core::error::Error::PlayerNotInSession(bot_id.to_owned()))?;
        (
            participant.bot_profile.unwrap_or(BotProfile::Balanced),
            participant.remaining_dice,
        )
    };

    let dice_count = remaining.min(BOT_DICE_PER_ROLL).max(1);
    let request = RollRequest {
        roll_index: 1,
        dice: (0..dice_count)
            .map(|i| DieSpec {
                die_id: format!("d6-{i}"),
                sides: 6,
            })
            .collect(),
    };
    let roll = turn::apply_roll(session, bot_id, &request, now)?;

    let selected = select_dice(&roll, profile);
    let points: u64 = selected
        .iter()
        .map(|id| {
            roll.dice
                .iter()
                .find(|d| &d.die_id == id)
                .map(|d| (d.sides - d.value) as u64)
                .unwrap_or(0)
        })
        .sum();
    let score = turn::apply_score(
        session,
        bot_id,
        &ScoreRequest {
            selected_dice_ids: selected,
            points,
            roll_server_id: roll.server_roll_id.clone(),
        },
        now,
    )?;
    let advance = turn::end_turn(session, bot_id, now)?;

    Ok(BotTurnOutcome {
        roll,
        score,
        advance,
    })
}

/// How greedily a bot banks dice depends on its profile. Cautious bots keep
/// the single best die, balanced bots keep the best two, aggressive bots
/// keep everything that scores.
fn select_dice(roll: &RollSnapshot, profile: BotProfile) -> Vec<String> {
    let mut by_margin: Vec<_> = roll.dice.iter().collect();
    by_margin.sort_by(|a, b| (b.sides - b.value).cmp(&(a.sides - a.value)));

    let keep = match profile {
        BotProfile::Cautious => 1,
        BotProfile::Balanced => 2,
        BotProfile::Aggressive => {
            let positive = by_margin.iter().filter(|d| d.value < d.sides).count();
            positive.max(1)
        }
    };
    by_margin
        .into_iter()
        .take(keep.min(roll.dice.len()))
        .map(|d| d.die_id.clone())
        .collect()
}

const FLAVOR_LINES: &[&str] = &[
    "is eyeing your dice tray",
    "taps the table impatiently",
    "claims this round for the house",
    "whistles an old tavern tune",
    "stacks their dice into a tiny tower",
    "mutters something about loaded dice",
];

pub enum FlavorKind {
    PlayerNotification,
    GameUpdate,
    ChaosAttack,
}

/// One flavor message from `bot_id` aimed at `target_id`.
pub fn flavor_message(bot_id: &str, bot_name: &str, target_id: &str) -> (FlavorKind, Map<String, Value>) {
    let mut rng = rand::thread_rng();
    let kind = match rng.gen_range(0..100) {
        0..=4 => FlavorKind::ChaosAttack,
        5..=29 => FlavorKind::GameUpdate,
        _ => FlavorKind::PlayerNotification,
    };
    let line = FLAVOR_LINES.choose(&mut rng).unwrap_or(&FLAVOR_LINES[0]);

    let mut body = Map::new();
    body.insert("playerId".into(), Value::String(bot_id.to_owned()));
    body.insert("sourcePlayerId".into(), Value::String(bot_id.to_owned()));
    body.insert("targetPlayerId".into(), Value::String(target_id.to_owned()));
    match kind {
        FlavorKind::ChaosAttack => {
            body.insert("attack".into(), Value::String("dice_scramble".into()));
        }
        _ => {
            body.insert(
                "message".into(),
                Value::String(format!("{bot_name} {line}")),
            );
        }
    }
    (kind, body)
}

/// Stamp identity fields into a passthrough body before fan-out. The
/// timestamp lives on the envelope.
pub fn annotate_passthrough(body: &mut Map<String, Value>, player_id: &str) {
    body.insert("playerId".into(), Value::String(player_id.to_owned()));
    body.insert(
        "sourcePlayerId".into(),
        Value::String(player_id.to_owned()),
    );
    body.remove("timestamp");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tumble_core::session::RoomKind;
    use tumble_core::turn::{ensure_turn_state, TurnPhase};

    fn session_with_bot_active() -> (Session, String) {
        let mut session = Session {
            session_id: "s1".into(),
            room_code: "ABCDEF".into(),
            room_kind: RoomKind::Private,
            public_room_slot: None,
            game_difficulty: GameDifficulty::Normal,
            created_at: 0,
            last_activity_at: 0,
            expires_at: u64::MAX,
            participants: HashMap::new(),
            turn_state: None,
        };
        seed_bots(&mut session, 1, 0);
        let bot_id = session.participants.keys().next().unwrap().clone();
        let mut human = Participant::human("p1", None, 1000);
        human.is_ready = true;
        session.participants.insert("p1".into(), human);
        ensure_turn_state(&mut session, 60_000, 2000);
        (session, bot_id)
    }

    #[test]
    fn test_seed_bots_cycles_roster() {
        let mut session = Session {
            session_id: "s2".into(),
            room_code: "ABCDEF".into(),
            room_kind: RoomKind::Private,
            public_room_slot: None,
            game_difficulty: GameDifficulty::Normal,
            created_at: 0,
            last_activity_at: 0,
            expires_at: u64::MAX,
            participants: HashMap::new(),
            turn_state: None,
        };
        seed_bots(&mut session, 4, 0);
        assert_eq!(session.bot_count(), 4);
        assert!(session.participants.values().all(|p| p.is_ready));
    }

    #[test]
    fn test_bot_turn_runs_roll_score_end() {
        let (mut session, bot_id) = session_with_bot_active();
        // bots were seeded first so the bot opens the game
        assert_eq!(
            session
                .turn_state
                .as_ref()
                .unwrap()
                .active_turn_player_id
                .as_deref(),
            Some(bot_id.as_str())
        );
        let outcome = take_turn(&mut session, &bot_id, 3000).unwrap();
        assert!(!outcome.score.selected_dice_ids.is_empty());
        assert_eq!(outcome.advance.previous_player_id.as_deref(), Some(bot_id.as_str()));
        assert_eq!(outcome.advance.next_player_id.as_deref(), Some("p1"));
        let bot = &session.participants[&bot_id];
        assert!(bot.remaining_dice < 15);
        assert_eq!(
            session.turn_state.as_ref().unwrap().phase,
            TurnPhase::AwaitRoll
        );
    }

    #[test]
    fn test_turn_delay_respects_profile_ranges() {
        for _ in 0..32 {
            let delay = turn_delay_ms(BotProfile::Aggressive, GameDifficulty::Normal);
            assert!((900..=2200).contains(&delay));
            let delay = turn_delay_ms(BotProfile::Cautious, GameDifficulty::Normal);
            assert!((2300..=4200).contains(&delay));
        }
    }
}
