//! The session record and its participants.
//!
//! A session ("room") is owned exclusively by the room catalog. Everything
//! else refers to it by id and re-resolves through the catalog.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::turn::TurnState;

pub const START_DICE_PER_PLAYER: u32 = 15;
pub const MAX_MULTIPLAYER_BOTS: usize = 4;
pub const ROOM_CODE_MAX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Private,
    PublicDefault,
    PublicOverflow,
}

impl RoomKind {
    pub fn is_public(&self) -> bool {
        !matches!(self, RoomKind::Private)
    }

    /// Resolution priority for joining by room code, lower wins.
    pub fn priority(&self) -> u8 {
        match self {
            RoomKind::Private => 0,
            RoomKind::PublicOverflow => 1,
            RoomKind::PublicDefault => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GameDifficulty {
    Easy,
    #[default]
    Normal,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotProfile {
    Cautious,
    Balanced,
    Aggressive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub player_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub joined_at: u64,
    pub last_heartbeat_at: u64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_profile: Option<BotProfile>,
    #[serde(default)]
    pub is_ready: bool,
    #[serde(default)]
    pub score: u64,
    pub remaining_dice: u32,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl Participant {
    pub fn human(player_id: &str, display_name: Option<String>, now: u64) -> Self {
        Self {
            player_id: player_id.to_owned(),
            display_name,
            joined_at: now,
            last_heartbeat_at: now,
            is_bot: false,
            bot_profile: None,
            is_ready: false,
            score: 0,
            remaining_dice: START_DICE_PER_PLAYER,
            is_complete: false,
            completed_at: None,
        }
    }

    pub fn bot(player_id: &str, display_name: &str, profile: BotProfile, now: u64) -> Self {
        Self {
            player_id: player_id.to_owned(),
            display_name: Some(display_name.to_owned()),
            joined_at: now,
            last_heartbeat_at: now,
            is_bot: true,
            bot_profile: Some(profile),
            // Bots are always ready
            is_ready: true,
            score: 0,
            remaining_dice: START_DICE_PER_PLAYER,
            is_complete: false,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub room_code: String,
    pub room_kind: RoomKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_room_slot: Option<u32>,
    #[serde(default)]
    pub game_difficulty: GameDifficulty,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub expires_at: u64,
    pub participants: HashMap<String, Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_state: Option<TurnState>,
}

impl Session {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    /// Refresh activity and push the expiry out by `ttl_ms`.
    pub fn touch(&mut self, ttl_ms: u64, now: u64) {
        self.last_activity_at = now;
        self.expires_at = now + ttl_ms;
    }

    pub fn human_count(&self) -> usize {
        self.participants.values().filter(|p| !p.is_bot).count()
    }

    pub fn bot_count(&self) -> usize {
        self.participants.values().filter(|p| p.is_bot).count()
    }

    pub fn has_bots(&self) -> bool {
        self.participants.values().any(|p| p.is_bot)
    }

    /// Humans active within the given heartbeat window.
    pub fn active_human_count(&self, window_ms: u64, now: u64) -> usize {
        self.participants
            .values()
            .filter(|p| !p.is_bot && p.last_heartbeat_at + window_ms > now)
            .count()
    }

    /// All humans ready. A session with no humans never runs turns.
    pub fn humans_ready(&self) -> bool {
        let mut any = false;
        for p in self.participants.values().filter(|p| !p.is_bot) {
            any = true;
            if !p.is_ready {
                return false;
            }
        }
        any
    }

    /// The match is over when every human has used up their dice.
    pub fn is_game_complete(&self) -> bool {
        let humans: Vec<_> = self.participants.values().filter(|p| !p.is_bot).collect();
        !humans.is_empty() && humans.iter().all(|p| p.is_complete)
    }

    /// Participants in join order. The turn order and every client-facing
    /// listing derive from this.
    pub fn participants_in_join_order(&self) -> Vec<&Participant> {
        let mut list: Vec<&Participant> = self.participants.values().collect();
        list.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.player_id.cmp(&b.player_id))
        });
        list
    }

    /// Standings: complete first, then ascending score, ascending remaining
    /// dice, earlier completion, earlier join, lexicographic id.
    pub fn standings(&self) -> Vec<&Participant> {
        let mut list: Vec<&Participant> = self.participants.values().collect();
        list.sort_by(|a, b| {
            b.is_complete
                .cmp(&a.is_complete)
                .then_with(|| a.score.cmp(&b.score))
                .then_with(|| a.remaining_dice.cmp(&b.remaining_dice))
                .then_with(|| {
                    a.completed_at
                        .unwrap_or(u64::MAX)
                        .cmp(&b.completed_at.unwrap_or(u64::MAX))
                })
                .then_with(|| a.joined_at.cmp(&b.joined_at))
                .then_with(|| a.player_id.cmp(&b.player_id))
        });
        list
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.session_id.clone(),
            room_code: self.room_code.clone(),
            room_kind: self.room_kind,
            game_difficulty: self.game_difficulty,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            expires_at: self.expires_at,
            participants: self
                .participants_in_join_order()
                .into_iter()
                .cloned()
                .collect(),
            turn_state: self.turn_state.clone(),
            standings: self
                .standings()
                .into_iter()
                .map(|p| p.player_id.clone())
                .collect(),
        }
    }
}

/// The client-facing snapshot of a session, sent as `session_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub room_code: String,
    pub room_kind: RoomKind,
    pub game_difficulty: GameDifficulty,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub expires_at: u64,
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_state: Option<TurnState>,
    pub standings: Vec<String>,
}
