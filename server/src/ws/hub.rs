//! Per-session subscriber sets and broadcast fan-out.
//!
//! Registration and broadcast never await: subscribers hold unbounded
//! channels drained by their connection's writer task, so fan-out can run
//! while the catalog lock is held and the delivery order matches handler
//! completion order. Broadcast snapshots the subscriber list before
//! sending, so concurrent disconnects never disturb an iteration.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use tumble_core::message::ServerMessage;

use super::frame::CLOSE_NORMAL;

/// What a connection's writer task can be asked to put on the wire.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(String),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

struct Subscriber {
    conn_id: u64,
    player_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
pub struct Hub {
    sessions: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_conn_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        session_id: &str,
        player_id: &str,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut sessions = self.sessions.lock().expect("hub poisoned");
        sessions
            .entry(session_id.to_owned())
            .or_default()
            .push(Subscriber {
                conn_id,
                player_id: player_id.to_owned(),
                tx,
            });
        debug!(
            "Subscriber {} registered for {} as {}",
            conn_id, session_id, player_id
        );
        conn_id
    }

    pub fn unregister(&self, session_id: &str, conn_id: u64) {
        let mut sessions = self.sessions.lock().expect("hub poisoned");
        if let Some(subscribers) = sessions.get_mut(session_id) {
            subscribers.retain(|s| s.conn_id != conn_id);
            if subscribers.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    /// Fan a message out to the session, optionally skipping the sender.
    pub fn broadcast(&self, session_id: &str, exclude_player: Option<&str>, message: &ServerMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                debug!("Failed to encode broadcast: {}", e);
                return;
            }
        };
        let targets: Vec<mpsc::UnboundedSender<Outbound>> = {
            let sessions = self.sessions.lock().expect("hub poisoned");
            match sessions.get(session_id) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter(|s| exclude_player != Some(s.player_id.as_str()))
                    .map(|s| s.tx.clone())
                    .collect(),
                None => return,
            }
        };
        for tx in targets {
            // a closed receiver only means the connection is going away
            let _ = tx.send(Outbound::Text(text.clone()));
        }
    }

    /// Deliver to every connection of one player in the session.
    pub fn send_to(&self, session_id: &str, player_id: &str, message: &ServerMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                debug!("Failed to encode message: {}", e);
                return;
            }
        };
        let targets: Vec<mpsc::UnboundedSender<Outbound>> = {
            let sessions = self.sessions.lock().expect("hub poisoned");
            match sessions.get(session_id) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter(|s| s.player_id == player_id)
                    .map(|s| s.tx.clone())
                    .collect(),
                None => return,
            }
        };
        for tx in targets {
            let _ = tx.send(Outbound::Text(text.clone()));
        }
    }

    pub fn connected_players(&self, session_id: &str) -> HashSet<String> {
        let sessions = self.sessions.lock().expect("hub poisoned");
        sessions
            .get(session_id)
            .map(|subscribers| subscribers.iter().map(|s| s.player_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of connectivity across all sessions, for reconciliation.
    pub fn connected_map(&self) -> HashMap<String, HashSet<String>> {
        let sessions = self.sessions.lock().expect("hub poisoned");
        sessions
            .iter()
            .map(|(session_id, subscribers)| {
                (
                    session_id.clone(),
                    subscribers.iter().map(|s| s.player_id.clone()).collect(),
                )
            })
            .collect()
    }

    /// Close every connection of one player, e.g. when they leave over HTTP.
    pub fn kick_player(&self, session_id: &str, player_id: &str, code: u16, reason: &str) {
        let targets: Vec<mpsc::UnboundedSender<Outbound>> = {
            let sessions = self.sessions.lock().expect("hub poisoned");
            match sessions.get(session_id) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter(|s| s.player_id == player_id)
                    .map(|s| s.tx.clone())
                    .collect(),
                None => return,
            }
        };
        for tx in targets {
            let _ = tx.send(Outbound::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }

    /// Close the whole session, e.g. on expiry.
    pub fn close_session(&self, session_id: &str, code: u16, reason: &str) {
        let targets: Vec<mpsc::UnboundedSender<Outbound>> = {
            let mut sessions = self.sessions.lock().expect("hub poisoned");
            match sessions.remove(session_id) {
                Some(subscribers) => subscribers.into_iter().map(|s| s.tx).collect(),
                None => return,
            }
        };
        for tx in targets {
            let _ = tx.send(Outbound::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }

    pub fn shutdown(&self) {
        let all: Vec<String> = {
            let sessions = self.sessions.lock().expect("hub poisoned");
            sessions.keys().cloned().collect()
        };
        for session_id in all {
            self.close_session(&session_id, CLOSE_NORMAL, "server_shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tumble_core::message::MessageSource;

    fn message() -> ServerMessage {
        ServerMessage::TurnAutoAdvanced {
            session_id: "s1".into(),
            timestamp: 1,
            source: MessageSource::TimeoutAuto,
            player_id: "p1".into(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let hub = Hub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.register("s1", "p1", tx1);
        hub.register("s1", "p2", tx2);

        hub.broadcast("s1", Some("p1"), &message());
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv().unwrap(), Outbound::Text(_)));
    }

    #[tokio::test]
    async fn test_unregister_removes_subscriber() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn_id = hub.register("s1", "p1", tx);
        hub.unregister("s1", conn_id);
        hub.broadcast("s1", None, &message());
        assert!(rx.try_recv().is_err());
        assert!(hub.connected_players("s1").is_empty());
    }

    #[tokio::test]
    async fn test_close_session_sends_close() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("s1", "p1", tx);
        hub.close_session("s1", 4408, "session_expired");
        match rx.try_recv().unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, 4408);
                assert_eq!(reason, "session_expired");
            }
            other => panic!("unexpected outbound: {:?}", other),
        }
    }
}
