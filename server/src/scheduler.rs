//! Per-session timers: the bot flavor tick, the bot-turn one-shot and the
//! turn-timeout pair.
//!
//! Timers hold session ids and turn keys, never references. Every fire
//! goes back through the signal loop, which re-resolves the session and
//! drops stale fires. Re-arming with an identical turn key is a no-op;
//! a new key cancels the old timer and arms a fresh one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use tumble_core::session::{BotProfile, GameDifficulty};
use tumble_core::turn::TurnKey;
use tumble_core::unix_now_ms;

use crate::bots;
use crate::frame::SignalFrame;

/// Everything the scheduler needs to know about one session, gathered
/// under the catalog lock.
#[derive(Debug, Clone)]
pub struct SchedulerFacts {
    pub session_id: String,
    pub exists: bool,
    pub has_bots: bool,
    pub humans_connected: bool,
    pub active_bot_profile: Option<BotProfile>,
    pub difficulty: GameDifficulty,
    pub order_len: usize,
    pub turn_key: Option<TurnKey>,
    pub turn_expires_at: Option<u64>,
    pub warning_ms: u64,
}

impl SchedulerFacts {
    pub fn gone(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            exists: false,
            has_bots: false,
            humans_connected: false,
            active_bot_profile: None,
            difficulty: GameDifficulty::Normal,
            order_len: 0,
            turn_key: None,
            turn_expires_at: None,
            warning_ms: 0,
        }
    }
}

#[derive(Default)]
struct SessionTimers {
    flavor: Option<JoinHandle<()>>,
    bot_turn: Option<(TurnKey, JoinHandle<()>)>,
    timeout: Option<(TurnKey, JoinHandle<()>)>,
}

impl SessionTimers {
    fn abort_all(&mut self) {
        if let Some(handle) = self.flavor.take() {
            handle.abort();
        }
        if let Some((_, handle)) = self.bot_turn.take() {
            handle.abort();
        }
        if let Some((_, handle)) = self.timeout.take() {
            handle.abort();
        }
    }
}

pub struct Scheduler {
    signal_tx: mpsc::Sender<SignalFrame>,
    timers: Mutex<HashMap<String, SessionTimers>>,
}

impl Scheduler {
    pub fn new(signal_tx: mpsc::Sender<SignalFrame>) -> Self {
        Self {
            signal_tx,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Bring this session's timers in line with the given facts.
    pub fn reconcile(&self, facts: SchedulerFacts) {
        let mut timers = self.timers.lock().expect("scheduler poisoned");

        if !facts.exists {
            if let Some(mut entry) = timers.remove(&facts.session_id) {
                debug!("Cancelling timers for removed session {}", facts.session_id);
                entry.abort_all();
            }
            return;
        }

        let entry = timers.entry(facts.session_id.clone()).or_default();

        self.reconcile_flavor(entry, &facts);
        self.reconcile_bot_turn(entry, &facts);
        self.reconcile_timeout(entry, &facts);
    }

    fn reconcile_flavor(&self, entry: &mut SessionTimers, facts: &SchedulerFacts) {
        let wanted = facts.has_bots && facts.humans_connected;
        let running = entry
            .flavor
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        if wanted && !running {
            let session_id = facts.session_id.clone();
            let tx = self.signal_tx.clone();
            entry.flavor = Some(tokio::spawn(async move {
                loop {
                    let delay = bots::flavor_delay_ms();
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if tx
                        .send(SignalFrame::BotFlavor {
                            session_id: session_id.clone(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        } else if !wanted {
            if let Some(handle) = entry.flavor.take() {
                handle.abort();
            }
        }
    }

    fn reconcile_bot_turn(&self, entry: &mut SessionTimers, facts: &SchedulerFacts) {
        let wanted_key = match (&facts.active_bot_profile, facts.humans_connected) {
            (Some(_), true) => facts.turn_key.clone(),
            _ => None,
        };

        match (&entry.bot_turn, &wanted_key) {
            // idempotent on re-arm with the same turn key
            (Some((current, _)), Some(wanted)) if current == wanted => return,
            _ => (),
        }
        if let Some((_, handle)) = entry.bot_turn.take() {
            handle.abort();
        }

        let Some(key) = wanted_key else { return };
        let profile = facts
            .active_bot_profile
            .unwrap_or(BotProfile::Balanced);
        let delay = bots::turn_delay_ms(profile, facts.difficulty);
        let session_id = facts.session_id.clone();
        let tx = self.signal_tx.clone();
        let task_key = key.clone();
        debug!(
            "Arming bot turn for {} in {}ms",
            facts.session_id, delay
        );
        entry.bot_turn = Some((
            key,
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let _ = tx
                    .send(SignalFrame::BotTurn {
                        session_id,
                        turn_key: task_key,
                    })
                    .await;
            }),
        ));
    }

    fn reconcile_timeout(&self, entry: &mut SessionTimers, facts: &SchedulerFacts) {
        let wanted_key = match (&facts.turn_key, facts.turn_expires_at) {
            (Some(key), Some(_))
                if key.active_turn_player_id.is_some()
                    && facts.order_len >= 2
                    && facts.humans_connected =>
            {
                facts.turn_key.clone()
            }
            _ => None,
        };

        match (&entry.timeout, &wanted_key) {
            (Some((current, _)), Some(wanted)) if current == wanted => return,
            _ => (),
        }
        if let Some((_, handle)) = entry.timeout.take() {
            handle.abort();
        }

        let Some(key) = wanted_key else { return };
        let expires_at = facts.turn_expires_at.unwrap_or_default();
        let warning_ms = facts.warning_ms;
        let session_id = facts.session_id.clone();
        let tx = self.signal_tx.clone();
        let task_key = key.clone();
        entry.timeout = Some((
            key,
            tokio::spawn(async move {
                let now = unix_now_ms();
                let warning_at = expires_at.saturating_sub(warning_ms);
                if warning_at > now {
                    tokio::time::sleep(Duration::from_millis(warning_at - now)).await;
                    let _ = tx
                        .send(SignalFrame::TurnTimeoutWarning {
                            session_id: session_id.clone(),
                            turn_key: task_key.clone(),
                        })
                        .await;
                }
                let now = unix_now_ms();
                if expires_at > now {
                    tokio::time::sleep(Duration::from_millis(expires_at - now)).await;
                }
                let _ = tx
                    .send(SignalFrame::TurnTimeout {
                        session_id,
                        turn_key: task_key,
                    })
                    .await;
            }),
        ));
    }

    pub fn cancel_session(&self, session_id: &str) {
        let mut timers = self.timers.lock().expect("scheduler poisoned");
        if let Some(mut entry) = timers.remove(session_id) {
            entry.abort_all();
        }
    }

    pub fn shutdown(&self) {
        let mut timers = self.timers.lock().expect("scheduler poisoned");
        for (_, mut entry) in timers.drain() {
            entry.abort_all();
        }
    }

    #[cfg(test)]
    fn armed_timeout_key(&self, session_id: &str) -> Option<TurnKey> {
        let timers = self.timers.lock().unwrap();
        timers
            .get(session_id)
            .and_then(|t| t.timeout.as_ref())
            .map(|(key, _)| key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(session_id: &str, key: Option<TurnKey>) -> SchedulerFacts {
        SchedulerFacts {
            session_id: session_id.to_owned(),
            exists: true,
            has_bots: false,
            humans_connected: true,
            active_bot_profile: None,
            difficulty: GameDifficulty::Normal,
            order_len: 2,
            turn_key: key,
            turn_expires_at: Some(unix_now_ms() + 60_000),
            warning_ms: 10_000,
        }
    }

    fn key_for(player: &str, turn: u32) -> TurnKey {
        TurnKey {
            active_turn_player_id: Some(player.to_owned()),
            round: 1,
            turn_number: turn,
        }
    }

    #[tokio::test]
    async fn test_rearm_same_key_is_noop() {
        let (tx, _rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(tx);
        scheduler.reconcile(facts("s1", Some(key_for("p1", 1))));
        let first = scheduler.armed_timeout_key("s1").unwrap();
        scheduler.reconcile(facts("s1", Some(key_for("p1", 1))));
        assert_eq!(scheduler.armed_timeout_key("s1").unwrap(), first);
    }

    #[tokio::test]
    async fn test_new_key_replaces_timer() {
        let (tx, _rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(tx);
        scheduler.reconcile(facts("s1", Some(key_for("p1", 1))));
        scheduler.reconcile(facts("s1", Some(key_for("p2", 2))));
        assert_eq!(
            scheduler.armed_timeout_key("s1").unwrap(),
            key_for("p2", 2)
        );
    }

    #[tokio::test]
    async fn test_removed_session_cancels_timers() {
        let (tx, _rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(tx);
        scheduler.reconcile(facts("s1", Some(key_for("p1", 1))));
        scheduler.reconcile(SchedulerFacts::gone("s1"));
        assert!(scheduler.armed_timeout_key("s1").is_none());
    }

    #[tokio::test]
    async fn test_solo_session_gets_no_timeout() {
        let (tx, _rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(tx);
        let mut solo = facts("s1", Some(key_for("p1", 1)));
        solo.order_len = 1;
        scheduler.reconcile(solo);
        assert!(scheduler.armed_timeout_key("s1").is_none());
    }
}
