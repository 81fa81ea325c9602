//! The process-wide durable state.
//!
//! A single [`Snapshot`] holds everything the store adapter persists. It is
//! loaded once at boot and written back opportunistically after mutations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Session;

pub const SNAPSHOT_VERSION: u32 = 1;
pub const MAX_GAME_LOGS: usize = 500;
pub const MAX_LEADERBOARD_ENTRIES: usize = 1000;

/// A player's saved profile. The contents are opaque to the server; clients
/// read and write it as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerProfileRecord {
    pub player_id: String,
    pub updated_at: u64,
    pub data: Value,
}

/// An issued token, stored under its SHA-256 hex hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub player_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl TokenRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub id: String,
    pub uid: String,
    pub display_name: String,
    pub score: u64,
    pub duration_ms: u64,
    pub rolls: u32,
    pub timestamp: u64,
}

impl LeaderboardEntry {
    /// Lower compares better: score, then duration, then rolls, then the
    /// earlier submission.
    pub fn cmp_rank(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| self.duration_ms.cmp(&other.duration_ms))
            .then_with(|| self.rolls.cmp(&other.rolls))
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameLogEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    pub message: String,
    pub timestamp: u64,
}

/// A verified external identity and its leaderboard display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalPlayerRecord {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub players: HashMap<String, PlayerProfileRecord>,
    #[serde(default)]
    pub access_tokens: HashMap<String, TokenRecord>,
    #[serde(default)]
    pub refresh_tokens: HashMap<String, TokenRecord>,
    #[serde(default)]
    pub multiplayer_sessions: HashMap<String, Session>,
    #[serde(default)]
    pub leaderboard_scores: HashMap<String, LeaderboardEntry>,
    #[serde(default)]
    pub game_logs: HashMap<String, GameLogEntry>,
    #[serde(default)]
    pub firebase_players: HashMap<String, ExternalPlayerRecord>,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            ..Default::default()
        }
    }

    /// Append a log entry, evicting the oldest while over the cap.
    pub fn insert_game_log(&mut self, entry: GameLogEntry) {
        self.game_logs.insert(entry.id.clone(), entry);
        while self.game_logs.len() > MAX_GAME_LOGS {
            let oldest = self
                .game_logs
                .values()
                .min_by_key(|e| (e.timestamp, e.id.clone()))
                .map(|e| e.id.clone());
            match oldest {
                Some(id) => {
                    self.game_logs.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Insert a leaderboard entry, evicting the worst-ranked while over the
    /// cap.
    pub fn insert_leaderboard_entry(&mut self, entry: LeaderboardEntry) {
        self.leaderboard_scores.insert(entry.id.clone(), entry);
        while self.leaderboard_scores.len() > MAX_LEADERBOARD_ENTRIES {
            let worst = self
                .leaderboard_scores
                .values()
                .max_by(|a, b| a.cmp_rank(b))
                .map(|e| e.id.clone());
            match worst {
                Some(id) => {
                    self.leaderboard_scores.remove(&id);
                }
                None => break,
            }
        }
    }

    pub fn ranked_leaderboard(&self) -> Vec<&LeaderboardEntry> {
        let mut entries: Vec<&LeaderboardEntry> = self.leaderboard_scores.values().collect();
        entries.sort_by(|a, b| a.cmp_rank(b));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(id: &str, timestamp: u64) -> GameLogEntry {
        GameLogEntry {
            id: id.into(),
            session_id: None,
            player_id: None,
            level: None,
            message: "m".into(),
            timestamp,
        }
    }

    fn score(id: &str, score: u64, duration_ms: u64) -> LeaderboardEntry {
        LeaderboardEntry {
            id: id.into(),
            uid: format!("uid-{id}"),
            display_name: format!("name-{id}"),
            score,
            duration_ms,
            rolls: 10,
            timestamp: 1,
        }
    }

    #[test]
    fn test_game_log_cap_evicts_oldest() {
        let mut snapshot = Snapshot::new();
        for i in 0..MAX_GAME_LOGS + 3 {
            snapshot.insert_game_log(log(&format!("l{i:04}"), i as u64));
        }
        assert_eq!(snapshot.game_logs.len(), MAX_GAME_LOGS);
        assert!(!snapshot.game_logs.contains_key("l0000"));
        assert!(!snapshot.game_logs.contains_key("l0002"));
        assert!(snapshot.game_logs.contains_key("l0003"));
    }

    #[test]
    fn test_leaderboard_cap_evicts_worst() {
        let mut snapshot = Snapshot::new();
        for i in 0..MAX_LEADERBOARD_ENTRIES {
            snapshot.insert_leaderboard_entry(score(&format!("e{i:05}"), i as u64, 1000));
        }
        // A new best entry pushes out the worst score.
        snapshot.insert_leaderboard_entry(score("best", 0, 1));
        assert_eq!(snapshot.leaderboard_scores.len(), MAX_LEADERBOARD_ENTRIES);
        assert!(snapshot.leaderboard_scores.contains_key("best"));
        let worst_id = format!("e{:05}", MAX_LEADERBOARD_ENTRIES - 1);
        assert!(!snapshot.leaderboard_scores.contains_key(&worst_id));
    }

    #[test]
    fn test_ranking_orders_by_score_then_duration() {
        let mut snapshot = Snapshot::new();
        snapshot.insert_leaderboard_entry(score("slow", 5, 9000));
        snapshot.insert_leaderboard_entry(score("fast", 5, 1000));
        snapshot.insert_leaderboard_entry(score("low", 2, 9000));
        let ranked: Vec<&str> = snapshot
            .ranked_leaderboard()
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(ranked, vec!["low", "fast", "slow"]);
    }

    #[test]
    fn test_snapshot_round_trips_through_json() {
        let mut snapshot = Snapshot::new();
        snapshot.insert_game_log(log("l1", 5));
        snapshot.insert_leaderboard_entry(score("e1", 3, 100));
        snapshot.firebase_players.insert(
            "u1".into(),
            ExternalPlayerRecord {
                uid: "u1".into(),
                display_name: Some("Ada".into()),
                email: None,
                updated_at: 9,
            },
        );
        let text = serde_json::to_string(&snapshot).unwrap();
        let restored: Snapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(snapshot, restored);
    }
}
