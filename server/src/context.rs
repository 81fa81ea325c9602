//! Application runtime context.
//!
//! One `ApplicationContext` owns every subsystem. The room state lives in
//! a single `Mutex<Snapshot>`: HTTP handlers, WebSocket dispatch and timer
//! fires all serialize through it, so no handler ever observes another
//! mid-mutation. Timer fires arrive as [`SignalFrame`]s and re-resolve
//! their session by id.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tumble_core::error::{Error, Result};
use tumble_core::message::{MessageSource, ServerMessage, TurnActionKind};
use tumble_core::params::{
    CreateSessionParams, HeartbeatResponse, JoinSessionParams, RoomSummary, SessionJoinResponse,
};
use tumble_core::session::{BotProfile, Participant, Session};
use tumble_core::state::Snapshot;
use tumble_core::turn::{self, ensure_turn_state, RollRequest, ScoreRequest, TurnKey};
use tumble_core::unix_now_ms;
use tumble_env::Config;
use tumble_storage::{create_storage, StorageT};

use crate::bots::{self, FlavorKind};
use crate::catalog::{self, ConnectedMap, LeaveOutcome, RoomPolicy};
use crate::frame::SignalFrame;
use crate::identity::IdentityVerifier;
use crate::scheduler::{Scheduler, SchedulerFacts};
use crate::vault::Vault;
use crate::ws::frame::{CLOSE_NORMAL, CLOSE_SESSION_EXPIRED};
use crate::ws::hub::Hub;

const CLEANUP_INTERVAL_MS: u64 = 30_000;

pub struct ApplicationContext {
    pub config: Config,
    pub policy: RoomPolicy,
    pub vault: Vault,
    pub identity: IdentityVerifier,
    pub storage: Arc<dyn StorageT>,
    pub hub: Hub,
    pub scheduler: Scheduler,
    state: Mutex<Snapshot>,
    signal_tx: mpsc::Sender<SignalFrame>,
}

fn session_state_message(session: &Session, source: MessageSource, now: u64) -> ServerMessage {
    ServerMessage::SessionState {
        session_id: session.session_id.clone(),
        timestamp: now,
        source,
        session: session.view(),
    }
}

fn turn_start_message(session: &Session, source: MessageSource, now: u64) -> Option<ServerMessage> {
    let ts = session.turn_state.as_ref()?;
    let player_id = ts.active_turn_player_id.clone()?;
    Some(ServerMessage::TurnStart {
        session_id: session.session_id.clone(),
        timestamp: now,
        source,
        player_id,
        round: ts.round,
        turn_number: ts.turn_number,
        turn_expires_at: ts.turn_expires_at,
    })
}

impl ApplicationContext {
    pub async fn try_new_and_start_signal_loop(
        config: Config,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        info!("Initialize application context");

        let storage = create_storage(&config.store);
        let mut snapshot = storage.load().await?;

        let policy = RoomPolicy::from_config(&config);
        let now = unix_now_ms();
        catalog::cleanup(&mut snapshot, &policy, &ConnectedMap::new(), now);

        let (signal_tx, signal_rx) = mpsc::channel(32);
        let identity = IdentityVerifier::new(&config.identity);

        let ctx = Arc::new(Self {
            policy,
            vault: Vault::default(),
            identity,
            storage,
            hub: Hub::new(),
            scheduler: Scheduler::new(signal_tx.clone()),
            state: Mutex::new(snapshot),
            signal_tx,
            config,
        });

        let join_handle = ctx.clone().start_signal_loop(signal_rx);
        ctx.clone().start_cleanup_ticker();
        ctx.persist().await;
        Ok((ctx, join_handle))
    }

    pub fn get_signal_sender(&self) -> mpsc::Sender<SignalFrame> {
        self.signal_tx.clone()
    }

    pub fn state(&self) -> &Mutex<Snapshot> {
        &self.state
    }

    fn start_signal_loop(self: Arc<Self>, mut signal_rx: mpsc::Receiver<SignalFrame>) -> JoinHandle<()> {
        info!("Starting signal loop");
        let ctx = self;
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                debug!("Signal: {}", signal);
                match signal {
                    SignalFrame::BotTurn {
                        session_id,
                        turn_key,
                    } => ctx.handle_bot_turn(&session_id, &turn_key).await,
                    SignalFrame::TurnTimeoutWarning {
                        session_id,
                        turn_key,
                    } => ctx.handle_timeout_warning(&session_id, &turn_key).await,
                    SignalFrame::TurnTimeout {
                        session_id,
                        turn_key,
                    } => ctx.handle_turn_timeout(&session_id, &turn_key).await,
                    SignalFrame::BotFlavor { session_id } => {
                        ctx.handle_bot_flavor(&session_id).await
                    }
                    SignalFrame::Cleanup => ctx.handle_cleanup().await,
                    SignalFrame::Shutdown => {
                        info!("Shutting down");
                        ctx.scheduler.shutdown();
                        ctx.hub.shutdown();
                        ctx.persist().await;
                        break;
                    }
                }
            }
            info!("Signal loop stopped");
        })
    }

    fn start_cleanup_ticker(self: Arc<Self>) {
        let signal_tx = self.signal_tx.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(CLEANUP_INTERVAL_MS));
            interval.tick().await;
            loop {
                interval.tick().await;
                if signal_tx.send(SignalFrame::Cleanup).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Flush the current snapshot. Failures are logged, never propagated:
    /// durability is best-effort behind the response.
    pub async fn persist(&self) {
        let snapshot = self.state.lock().await.clone();
        if let Err(e) = self.storage.save(&snapshot).await {
            warn!("State save failed: {}", e);
        }
    }

    fn ws_url(&self, session_id: &str, player_id: &str) -> String {
        format!(
            "{}/?session={}&playerId={}",
            self.config.server.ws_base_url.trim_end_matches('/'),
            session_id,
            player_id
        )
    }

    /// Rebuild this session's timers from the current state.
    fn reconcile_scheduler(&self, snapshot: &Snapshot, session_id: &str) {
        let facts = match snapshot.multiplayer_sessions.get(session_id) {
            None => SchedulerFacts::gone(session_id),
            Some(session) => {
                let connected = self.hub.connected_players(session_id);
                let ts = session.turn_state.as_ref();
                let active_bot_profile = ts
                    .and_then(|t| t.active_turn_player_id.as_deref())
                    .and_then(|id| session.participants.get(id))
                    .filter(|p| p.is_bot)
                    .map(|p| p.bot_profile.unwrap_or(BotProfile::Balanced));
                SchedulerFacts {
                    session_id: session_id.to_owned(),
                    exists: true,
                    has_bots: session.has_bots(),
                    humans_connected: !connected.is_empty(),
                    active_bot_profile,
                    difficulty: session.game_difficulty,
                    order_len: ts.map(|t| t.order.len()).unwrap_or(0),
                    turn_key: ts.map(|t| t.turn_key()),
                    turn_expires_at: ts.and_then(|t| t.turn_expires_at),
                    warning_ms: self.config.turns.turn_timeout_warning_ms,
                }
            }
        };
        self.scheduler.reconcile(facts);
    }

    // ---- session lifecycle -------------------------------------------------

    pub async fn create_session(
        &self,
        params: &CreateSessionParams,
    ) -> Result<SessionJoinResponse> {
        let now = unix_now_ms();
        let response = {
            let mut state = self.state.lock().await;
            let session_id = catalog::create_session(&mut state, &self.policy, params, now)?;
            let auth =
                self.vault
                    .issue_bundle(&mut state, &params.player_id, Some(&session_id), now);
            let session = &state.multiplayer_sessions[&session_id];
            let response = SessionJoinResponse {
                session_id: session_id.clone(),
                room_code: session.room_code.clone(),
                auth,
                ws_url: self.ws_url(&session_id, &params.player_id),
                session: session.view(),
            };
            self.reconcile_scheduler(&state, &session_id);
            response
        };
        self.persist().await;
        Ok(response)
    }

    pub async fn join_session_by_id(
        &self,
        session_id: &str,
        params: &JoinSessionParams,
    ) -> Result<SessionJoinResponse> {
        let now = unix_now_ms();
        let response = {
            let mut state = self.state.lock().await;
            catalog::join_session(&mut state, &self.policy, session_id, params, now)?;
            let auth =
                self.vault
                    .issue_bundle(&mut state, &params.player_id, Some(session_id), now);
            let session = &state.multiplayer_sessions[session_id];
            let response = SessionJoinResponse {
                session_id: session_id.to_owned(),
                room_code: session.room_code.clone(),
                auth,
                ws_url: self.ws_url(session_id, &params.player_id),
                session: session.view(),
            };
            self.hub.broadcast(
                session_id,
                Some(&params.player_id),
                &session_state_message(session, MessageSource::Server, now),
            );
            self.reconcile_scheduler(&state, session_id);
            response
        };
        self.persist().await;
        Ok(response)
    }

    pub async fn join_room_by_code(
        &self,
        code: &str,
        params: &JoinSessionParams,
    ) -> Result<SessionJoinResponse> {
        let now = unix_now_ms();
        let session_id = {
            let mut state = self.state.lock().await;
            let connected = self.hub.connected_map();
            catalog::reconcile_public_rooms(&mut state, &self.policy, &connected, now);
            catalog::resolve_room_code(&state, code, now)?
        };
        self.join_session_by_id(&session_id, params).await
    }

    pub async fn heartbeat(&self, session_id: &str, token: &str) -> Result<HeartbeatResponse> {
        let now = unix_now_ms();
        let response = {
            let mut state = self.state.lock().await;
            let record = self
                .vault
                .verify_access(&mut state, token, now)
                .ok_or_else(|| Error::Unauthorized("invalid access token".into()))?;
            if record.session_id.as_deref() != Some(session_id) {
                return Err(Error::Forbidden);
            }
            catalog::heartbeat(&mut state, &self.policy, session_id, &record.player_id, now)?;
            HeartbeatResponse {
                expires_at: state.multiplayer_sessions[session_id].expires_at,
            }
        };
        self.persist().await;
        Ok(response)
    }

    pub async fn leave_session(&self, session_id: &str, player_id: &str) -> Result<()> {
        let now = unix_now_ms();
        {
            let mut state = self.state.lock().await;
            let outcome =
                catalog::leave_session(&mut state, &self.policy, session_id, player_id, now)?;
            self.hub
                .kick_player(session_id, player_id, CLOSE_NORMAL, "left_room");
            match outcome {
                LeaveOutcome::SessionRemoved | LeaveOutcome::SessionReset => {
                    self.hub
                        .close_session(session_id, CLOSE_NORMAL, "session_closed");
                }
                LeaveOutcome::Left => {
                    if let Some(session) = state.multiplayer_sessions.get(session_id) {
                        self.hub.broadcast(
                            session_id,
                            None,
                            &session_state_message(session, MessageSource::Reassign, now),
                        );
                        if let Some(message) =
                            turn_start_message(session, MessageSource::Reassign, now)
                        {
                            self.hub.broadcast(session_id, None, &message);
                        }
                    }
                }
            }
            self.reconcile_scheduler(&state, session_id);
        }
        self.persist().await;
        Ok(())
    }

    /// Reissue session tokens for a participant the session already knows.
    pub async fn refresh_session_auth(
        &self,
        session_id: &str,
        player_id: &str,
    ) -> Result<SessionJoinResponse> {
        let now = unix_now_ms();
        let response = {
            let mut state = self.state.lock().await;
            let session = state
                .multiplayer_sessions
                .get(session_id)
                .ok_or(Error::SessionNotFound)?;
            if session.is_expired(now) {
                return Err(Error::SessionExpired);
            }
            if !session.participants.contains_key(player_id) {
                return Err(Error::PlayerNotInSession(player_id.to_owned()));
            }
            let room_code = session.room_code.clone();
            let view = session.view();
            let auth = self
                .vault
                .issue_bundle(&mut state, player_id, Some(session_id), now);
            SessionJoinResponse {
                session_id: session_id.to_owned(),
                room_code,
                auth,
                ws_url: self.ws_url(session_id, player_id),
                session: view,
            }
        };
        self.persist().await;
        Ok(response)
    }

    pub async fn list_rooms(&self, limit: Option<usize>) -> Vec<RoomSummary> {
        let now = unix_now_ms();
        let rooms = {
            let mut state = self.state.lock().await;
            let connected = self.hub.connected_map();
            catalog::list_rooms(&mut state, &self.policy, &connected, limit, now)
        };
        self.persist().await;
        rooms
    }

    // ---- turn actions ------------------------------------------------------

    pub async fn turn_roll(
        &self,
        session_id: &str,
        player_id: &str,
        request: &RollRequest,
        source: MessageSource,
    ) -> Result<()> {
        let now = unix_now_ms();
        {
            let mut state = self.state.lock().await;
            let message = {
                let session = state
                    .multiplayer_sessions
                    .get_mut(session_id)
                    .ok_or(Error::SessionNotFound)?;
                if session.is_expired(now) {
                    return Err(Error::SessionExpired);
                }
                let snapshot = turn::apply_roll(session, player_id, request, now)?;
                session.last_activity_at = now;
                ServerMessage::TurnAction {
                    session_id: session_id.to_owned(),
                    timestamp: now,
                    source,
                    player_id: player_id.to_owned(),
                    action: TurnActionKind::Roll,
                    roll: Some(snapshot),
                    score: None,
                }
            };
            self.hub.broadcast(session_id, None, &message);
            self.reconcile_scheduler(&state, session_id);
        }
        self.persist().await;
        Ok(())
    }

    pub async fn turn_score(
        &self,
        session_id: &str,
        player_id: &str,
        request: &ScoreRequest,
        source: MessageSource,
    ) -> Result<()> {
        let now = unix_now_ms();
        {
            let mut state = self.state.lock().await;
            let message = {
                let session = state
                    .multiplayer_sessions
                    .get_mut(session_id)
                    .ok_or(Error::SessionNotFound)?;
                if session.is_expired(now) {
                    return Err(Error::SessionExpired);
                }
                let summary = turn::apply_score(session, player_id, request, now)?;
                session.last_activity_at = now;
                ServerMessage::TurnAction {
                    session_id: session_id.to_owned(),
                    timestamp: now,
                    source,
                    player_id: player_id.to_owned(),
                    action: TurnActionKind::Score,
                    roll: None,
                    score: Some(summary),
                }
            };
            self.hub.broadcast(session_id, None, &message);
            self.reconcile_scheduler(&state, session_id);
        }
        self.persist().await;
        Ok(())
    }

    pub async fn turn_end(
        &self,
        session_id: &str,
        player_id: &str,
        source: MessageSource,
    ) -> Result<()> {
        let now = unix_now_ms();
        {
            let mut state = self.state.lock().await;
            let messages = {
                let session = state
                    .multiplayer_sessions
                    .get_mut(session_id)
                    .ok_or(Error::SessionNotFound)?;
                if session.is_expired(now) {
                    return Err(Error::SessionExpired);
                }
                let advance = turn::end_turn(session, player_id, now)?;
                ensure_turn_state(session, self.policy.turn_timeout_ms, now);
                session.last_activity_at = now;
                let mut messages = vec![ServerMessage::TurnEnd {
                    session_id: session_id.to_owned(),
                    timestamp: now,
                    source,
                    player_id: advance.previous_player_id,
                    next_player_id: advance.next_player_id,
                    round: advance.round,
                    turn_number: advance.turn_number,
                }];
                messages.extend(turn_start_message(session, MessageSource::Server, now));
                messages
            };
            for message in &messages {
                self.hub.broadcast(session_id, None, message);
            }
            self.reconcile_scheduler(&state, session_id);
        }
        self.persist().await;
        Ok(())
    }

    // ---- socket lifecycle --------------------------------------------------

    /// A participant's socket came up: they are ready, and everyone gets a
    /// fresh view.
    pub async fn mark_ready(&self, session_id: &str, player_id: &str) -> Result<()> {
        let now = unix_now_ms();
        {
            let mut state = self.state.lock().await;
            let messages = {
                let session = state
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
                participant.is_ready = true;
                participant.last_heartbeat_at = now;
                session.touch(self.policy.session_idle_ttl_ms, now);
                ensure_turn_state(session, self.policy.turn_timeout_ms, now);
                let mut messages =
                    vec![session_state_message(session, MessageSource::Ready, now)];
                messages.extend(turn_start_message(session, MessageSource::Ready, now));
                messages
            };
            for message in &messages {
                self.hub.broadcast(session_id, None, message);
            }
            self.reconcile_scheduler(&state, session_id);
        }
        self.persist().await;
        Ok(())
    }

    /// Send the reconstructible pair to one client, after an error or on
    /// demand.
    pub async fn resync_client(&self, session_id: &str, player_id: &str) {
        let now = unix_now_ms();
        let state = self.state.lock().await;
        if let Some(session) = state.multiplayer_sessions.get(session_id) {
            self.hub.send_to(
                session_id,
                player_id,
                &session_state_message(session, MessageSource::Server, now),
            );
            if let Some(message) = turn_start_message(session, MessageSource::Server, now) {
                self.hub.send_to(session_id, player_id, &message);
            }
        }
    }

    pub async fn on_disconnect(&self, session_id: &str, conn_id: u64) {
        self.hub.unregister(session_id, conn_id);
        let state = self.state.lock().await;
        self.reconcile_scheduler(&state, session_id);
    }

    /// Relay an annotated passthrough body to the rest of the session.
    pub async fn relay_passthrough(
        &self,
        session_id: &str,
        player_id: &str,
        message: ServerMessage,
    ) {
        let state = self.state.lock().await;
        if state.multiplayer_sessions.contains_key(session_id) {
            self.hub.broadcast(session_id, Some(player_id), &message);
        }
    }

    // ---- signal handlers ---------------------------------------------------

    async fn handle_bot_turn(&self, session_id: &str, turn_key: &TurnKey) {
        let now = unix_now_ms();
        let mut acted = false;
        {
            let mut state = self.state.lock().await;
            let connected = self.hub.connected_players(session_id);
            let messages = {
                let Some(session) = state.multiplayer_sessions.get_mut(session_id) else {
                    return;
                };
                let Some(ts) = session.turn_state.as_ref() else {
                    return;
                };
                if &ts.turn_key() != turn_key || connected.is_empty() {
                    return;
                }
                let Some(bot_id) = ts.active_turn_player_id.clone() else {
                    return;
                };
                if !session
                    .participants
                    .get(&bot_id)
                    .map(|p| p.is_bot)
                    .unwrap_or(false)
                {
                    return;
                }
                let outcome = match bots::take_turn(session, &bot_id, now) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Bot turn failed in {}: {}", session_id, e);
                        return;
                    }
                };
                ensure_turn_state(session, self.policy.turn_timeout_ms, now);
                session.last_activity_at = now;

                let mut messages = vec![
                    ServerMessage::TurnAction {
                        session_id: session_id.to_owned(),
                        timestamp: now,
                        source: MessageSource::BotAuto,
                        player_id: bot_id.clone(),
                        action: TurnActionKind::Roll,
                        roll: Some(outcome.roll),
                        score: None,
                    },
                    ServerMessage::TurnAction {
                        session_id: session_id.to_owned(),
                        timestamp: now,
                        source: MessageSource::BotAuto,
                        player_id: bot_id.clone(),
                        action: TurnActionKind::Score,
                        roll: None,
                        score: Some(outcome.score),
                    },
                    ServerMessage::TurnEnd {
                        session_id: session_id.to_owned(),
                        timestamp: now,
                        source: MessageSource::BotAuto,
                        player_id: outcome.advance.previous_player_id,
                        next_player_id: outcome.advance.next_player_id,
                        round: outcome.advance.round,
                        turn_number: outcome.advance.turn_number,
                    },
                ];
                messages.extend(turn_start_message(session, MessageSource::BotAuto, now));
                messages
            };
            for message in &messages {
                self.hub.broadcast(session_id, None, message);
            }
            self.reconcile_scheduler(&state, session_id);
            acted = true;
        }
        if acted {
            self.persist().await;
        }
    }

    async fn handle_timeout_warning(&self, session_id: &str, turn_key: &TurnKey) {
        let now = unix_now_ms();
        let state = self.state.lock().await;
        let Some(session) = state.multiplayer_sessions.get(session_id) else {
            return;
        };
        let Some(ts) = session.turn_state.as_ref() else {
            return;
        };
        if &ts.turn_key() != turn_key {
            return;
        }
        let (Some(player_id), Some(expires_at)) =
            (ts.active_turn_player_id.clone(), ts.turn_expires_at)
        else {
            return;
        };
        self.hub.broadcast(
            session_id,
            None,
            &ServerMessage::TurnTimeoutWarning {
                session_id: session_id.to_owned(),
                timestamp: now,
                source: MessageSource::Server,
                player_id,
                turn_expires_at: expires_at,
                remaining_ms: expires_at.saturating_sub(now),
            },
        );
    }

    async fn handle_turn_timeout(&self, session_id: &str, turn_key: &TurnKey) {
        let now = unix_now_ms();
        let mut acted = false;
        {
            let mut state = self.state.lock().await;
            let messages = {
                let Some(session) = state.multiplayer_sessions.get_mut(session_id) else {
                    return;
                };
                let Some(ts) = session.turn_state.as_ref() else {
                    return;
                };
                if &ts.turn_key() != turn_key {
                    return;
                }
                let Some(stalled) = ts.active_turn_player_id.clone() else {
                    return;
                };
                info!(
                    "Turn timeout in {}, advancing past {}",
                    session_id, stalled
                );
                let mut messages = vec![ServerMessage::TurnAutoAdvanced {
                    session_id: session_id.to_owned(),
                    timestamp: now,
                    source: MessageSource::TimeoutAuto,
                    player_id: stalled,
                }];
                match turn::advance_turn(session, now) {
                    Ok(advance) => {
                        ensure_turn_state(session, self.policy.turn_timeout_ms, now);
                        messages.push(ServerMessage::TurnEnd {
                            session_id: session_id.to_owned(),
                            timestamp: now,
                            source: MessageSource::TimeoutAuto,
                            player_id: advance.previous_player_id,
                            next_player_id: advance.next_player_id,
                            round: advance.round,
                            turn_number: advance.turn_number,
                        });
                        messages.extend(turn_start_message(
                            session,
                            MessageSource::TimeoutAuto,
                            now,
                        ));
                    }
                    Err(e) => warn!("Timeout advance failed in {}: {}", session_id, e),
                }
                messages
            };
            for message in &messages {
                self.hub.broadcast(session_id, None, message);
            }
            self.reconcile_scheduler(&state, session_id);
            acted = true;
        }
        if acted {
            self.persist().await;
        }
    }

    async fn handle_bot_flavor(&self, session_id: &str) {
        let now = unix_now_ms();
        let state = self.state.lock().await;
        let Some(session) = state.multiplayer_sessions.get(session_id) else {
            return;
        };
        let connected = self.hub.connected_players(session_id);
        let bots_in_room: Vec<&Participant> = session
            .participants
            .values()
            .filter(|p| p.is_bot)
            .collect();
        let humans_online: Vec<&Participant> = session
            .participants
            .values()
            .filter(|p| !p.is_bot && connected.contains(&p.player_id))
            .collect();
        let (Some(bot), Some(target)) = (
            bots_in_room.choose(&mut rand::thread_rng()),
            humans_online.choose(&mut rand::thread_rng()),
        ) else {
            return;
        };
        let (kind, body) = bots::flavor_message(
            &bot.player_id,
            bot.display_name.as_deref().unwrap_or("The House"),
            &target.player_id,
        );
        let message = match kind {
            FlavorKind::PlayerNotification => ServerMessage::PlayerNotification {
                session_id: session_id.to_owned(),
                timestamp: now,
                source: MessageSource::BotAuto,
                body,
            },
            FlavorKind::GameUpdate => ServerMessage::GameUpdate {
                session_id: session_id.to_owned(),
                timestamp: now,
                source: MessageSource::BotAuto,
                body,
            },
            FlavorKind::ChaosAttack => ServerMessage::ChaosAttack {
                session_id: session_id.to_owned(),
                timestamp: now,
                source: MessageSource::BotAuto,
                body,
            },
        };
        self.hub.broadcast(session_id, None, &message);
    }

    async fn handle_cleanup(&self) {
        let now = unix_now_ms();
        {
            let mut state = self.state.lock().await;
            let connected = self.hub.connected_map();
            let removed = catalog::cleanup(&mut state, &self.policy, &connected, now);
            let purged = self.vault.purge_expired(&mut state, now);
            if purged > 0 {
                debug!("Purged {} expired token hashes", purged);
            }
            for session_id in &removed {
                self.hub
                    .close_session(session_id, CLOSE_SESSION_EXPIRED, "session_expired");
                self.scheduler.cancel_session(session_id);
            }
            let ids: Vec<String> = state.multiplayer_sessions.keys().cloned().collect();
            for session_id in &ids {
                if let Some(session) = state.multiplayer_sessions.get_mut(session_id) {
                    ensure_turn_state(session, self.policy.turn_timeout_ms, now);
                }
                self.reconcile_scheduler(&state, session_id);
            }
        }
        self.persist().await;
    }
}
