//! Signals routed through the application's serialization domain.
//!
//! Timer tasks never touch state directly; they emit a frame and the
//! signal loop re-resolves the session by id, so a fire against a deleted
//! or re-keyed turn is a no-op.

use tumble_core::turn::TurnKey;

#[derive(Debug, Clone)]
pub enum SignalFrame {
    BotTurn {
        session_id: String,
        turn_key: TurnKey,
    },
    TurnTimeoutWarning {
        session_id: String,
        turn_key: TurnKey,
    },
    TurnTimeout {
        session_id: String,
        turn_key: TurnKey,
    },
    BotFlavor {
        session_id: String,
    },
    Cleanup,
    Shutdown,
}

impl std::fmt::Display for SignalFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalFrame::BotTurn { session_id, .. } => write!(f, "BotTurn: {}", session_id),
            SignalFrame::TurnTimeoutWarning { session_id, .. } => {
                write!(f, "TurnTimeoutWarning: {}", session_id)
            }
            SignalFrame::TurnTimeout { session_id, .. } => {
                write!(f, "TurnTimeout: {}", session_id)
            }
            SignalFrame::BotFlavor { session_id } => write!(f, "BotFlavor: {}", session_id),
            SignalFrame::Cleanup => write!(f, "Cleanup"),
            SignalFrame::Shutdown => write!(f, "Shutdown"),
        }
    }
}
