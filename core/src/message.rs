//! Wire messages for the WebSocket surface.
//!
//! Inbound and outbound sets are closed enums. The passthrough variants
//! carry opaque JSON bodies; the server only annotates the identity fields
//! before fanning them out.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::session::SessionView;
use crate::turn::{RollRequest, RollSnapshot, ScoreRequest, ScoreSummary};

/// Origin tag carried on every outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    Server,
    Player,
    BotAuto,
    TimeoutAuto,
    Reassign,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnActionKind {
    Roll,
    Score,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    ChaosAttack {
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    #[serde(rename = "particle:emit")]
    ParticleEmit {
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    GameUpdate {
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    PlayerNotification {
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    TurnAction {
        action: TurnActionKind,
        #[serde(default)]
        roll: Option<RollRequest>,
        #[serde(default)]
        score: Option<ScoreRequest>,
    },
    TurnEnd {
        #[serde(flatten)]
        body: Map<String, Value>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SessionState {
        session_id: String,
        timestamp: u64,
        source: MessageSource,
        session: SessionView,
    },
    TurnStart {
        session_id: String,
        timestamp: u64,
        source: MessageSource,
        player_id: String,
        round: u32,
        turn_number: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        turn_expires_at: Option<u64>,
    },
    TurnAction {
        session_id: String,
        timestamp: u64,
        source: MessageSource,
        player_id: String,
        action: TurnActionKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        roll: Option<RollSnapshot>,
        #[serde(skip_serializing_if = "Option::is_none")]
        score: Option<ScoreSummary>,
    },
    TurnEnd {
        session_id: String,
        timestamp: u64,
        source: MessageSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        player_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_player_id: Option<String>,
        round: u32,
        turn_number: u32,
    },
    TurnTimeoutWarning {
        session_id: String,
        timestamp: u64,
        source: MessageSource,
        player_id: String,
        turn_expires_at: u64,
        remaining_ms: u64,
    },
    TurnAutoAdvanced {
        session_id: String,
        timestamp: u64,
        source: MessageSource,
        player_id: String,
    },
    Error {
        session_id: String,
        timestamp: u64,
        source: MessageSource,
        code: String,
        reason: String,
    },
    ChaosAttack {
        session_id: String,
        timestamp: u64,
        source: MessageSource,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    #[serde(rename = "particle:emit")]
    ParticleEmit {
        session_id: String,
        timestamp: u64,
        source: MessageSource,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    GameUpdate {
        session_id: String,
        timestamp: u64,
        source: MessageSource,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    PlayerNotification {
        session_id: String,
        timestamp: u64,
        source: MessageSource,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
}

impl Display for ServerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerMessage::SessionState { session_id, .. } => {
                write!(f, "SessionState: {}", session_id)
            }
            ServerMessage::TurnStart {
                player_id,
                turn_number,
                ..
            } => write!(f, "TurnStart: {} #{}", player_id, turn_number),
            ServerMessage::TurnAction {
                player_id, action, ..
            } => write!(f, "TurnAction: {} {:?}", player_id, action),
            ServerMessage::TurnEnd { player_id, .. } => {
                write!(f, "TurnEnd: {:?}", player_id)
            }
            ServerMessage::TurnTimeoutWarning { player_id, .. } => {
                write!(f, "TurnTimeoutWarning: {}", player_id)
            }
            ServerMessage::TurnAutoAdvanced { player_id, .. } => {
                write!(f, "TurnAutoAdvanced: {}", player_id)
            }
            ServerMessage::Error { code, .. } => write!(f, "Error: {}", code),
            ServerMessage::ChaosAttack { .. } => write!(f, "ChaosAttack"),
            ServerMessage::ParticleEmit { .. } => write!(f, "ParticleEmit"),
            ServerMessage::GameUpdate { .. } => write!(f, "GameUpdate"),
            ServerMessage::PlayerNotification { .. } => write!(f, "PlayerNotification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_turn_action_parses() {
        let text = r#"{
            "type": "turn_action",
            "action": "roll",
            "roll": {"rollIndex": 1, "dice": [{"dieId": "d6-0", "sides": 6}]}
        }"#;
        let message: ClientMessage = serde_json::from_str(text).unwrap();
        match message {
            ClientMessage::TurnAction { action, roll, score } => {
                assert_eq!(action, TurnActionKind::Roll);
                let roll = roll.unwrap();
                assert_eq!(roll.dice.len(), 1);
                assert_eq!(roll.dice[0].die_id, "d6-0");
                assert!(score.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_passthrough_keeps_opaque_body() {
        let text = r#"{"type": "particle:emit", "effect": "sparks", "x": 4}"#;
        let message: ClientMessage = serde_json::from_str(text).unwrap();
        match message {
            ClientMessage::ParticleEmit { body } => {
                assert_eq!(body.get("effect").unwrap(), "sparks");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_server_message_carries_envelope_fields() {
        let message = ServerMessage::TurnAutoAdvanced {
            session_id: "s1".into(),
            timestamp: 42,
            source: MessageSource::TimeoutAuto,
            player_id: "p1".into(),
        };
        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "turn_auto_advanced");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["source"], "timeout_auto");
        assert_eq!(value["playerId"], "p1");
    }
}
