//! The WebSocket surface.
//!
//! Upgrades are authenticated before the handshake: the access token must
//! match both the player and the session carried in the query string.
//! After the handshake each connection runs a read loop plus a writer task
//! draining the hub channel, and a token-expiry deadline that force-closes
//! the socket with 4401.

pub mod frame;
pub mod hub;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hyper::header;
use hyper::{Body, Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tumble_core::error::Error;
use tumble_core::message::{ClientMessage, MessageSource, ServerMessage, TurnActionKind};
use tumble_core::unix_now_ms;

use crate::context::ApplicationContext;
use crate::http::error_response;
use frame::{
    close_payload, read_frame, write_frame, Opcode, CLOSE_BAD_REQUEST, CLOSE_NORMAL,
    CLOSE_UNAUTHORIZED, MAX_WS_MESSAGE_BYTES,
};
use hub::Outbound;

pub fn is_upgrade_request(req: &Request<Body>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_owned(), value.to_owned()))
        })
        .collect()
}

fn bad_handshake(reason: &str) -> Response<Body> {
    error_response(&Error::InvalidParams(reason.to_owned()))
}

/// Validate and accept a socket upgrade on `/`.
pub async fn handle_upgrade(
    ctx: Arc<ApplicationContext>,
    mut req: Request<Body>,
) -> Response<Body> {
    if req.uri().path() != "/" {
        return error_response(&Error::RoomNotFound);
    }

    let params = parse_query(req.uri().query().unwrap_or(""));
    let (Some(session_id), Some(player_id), Some(token)) = (
        params.get("session").cloned(),
        params.get("playerId").cloned(),
        params.get("token").cloned(),
    ) else {
        return bad_handshake("session, playerId and token are required");
    };

    let version_ok = req
        .headers()
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "13")
        .unwrap_or(false);
    if !version_ok {
        return bad_handshake("unsupported websocket version");
    }
    let Some(key) = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return bad_handshake("missing websocket key");
    };

    // Authorize before the handshake completes.
    let now = unix_now_ms();
    let token_expires_at = {
        let mut state = ctx.state().lock().await;
        let Some(record) = ctx.vault.verify_access(&mut state, &token, now) else {
            return error_response(&Error::Unauthorized("invalid access token".into()));
        };
        if record.player_id != player_id || record.session_id.as_deref() != Some(&session_id) {
            return error_response(&Error::Forbidden);
        }
        let Some(session) = state.multiplayer_sessions.get(&session_id) else {
            return error_response(&Error::SessionNotFound);
        };
        if session.is_expired(now) {
            return error_response(&Error::SessionExpired);
        }
        if !session.participants.contains_key(&player_id) {
            return error_response(&Error::Forbidden);
        }
        record.expires_at
    };

    let accept = frame::accept_key(&key);
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                run_connection(ctx, upgraded, session_id, player_id, token_expires_at).await;
            }
            Err(e) => warn!("Upgrade failed: {}", e),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(Body::empty())
        .expect("handshake response")
}

async fn run_connection<S>(
    ctx: Arc<ApplicationContext>,
    upgraded: S,
    session_id: String,
    player_id: String,
    token_expires_at: u64,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!("Socket connected: {} in {}", player_id, session_id);
    let (mut read_half, mut write_half) = tokio::io::split(upgraded);
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let conn_id = ctx.hub.register(&session_id, &player_id, tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let result = match outbound {
                Outbound::Text(text) => {
                    write_frame(&mut write_half, Opcode::Text, text.as_bytes()).await
                }
                Outbound::Pong(payload) => {
                    write_frame(&mut write_half, Opcode::Pong, &payload).await
                }
                Outbound::Close { code, reason } => {
                    let payload = close_payload(code, &reason);
                    let _ = write_frame(&mut write_half, Opcode::Close, &payload).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // The connecting player is now ready; everyone gets the fresh view and
    // this client gets its own resync pair.
    if let Err(e) = ctx.mark_ready(&session_id, &player_id).await {
        warn!("Ready failed for {}: {}", player_id, e);
        let _ = tx.send(Outbound::Close {
            code: frame::CLOSE_SESSION_EXPIRED,
            reason: e.reason().to_owned(),
        });
        ctx.on_disconnect(&session_id, conn_id).await;
        drop(tx);
        let _ = writer.await;
        return;
    }
    ctx.resync_client(&session_id, &player_id).await;

    loop {
        let until_expiry =
            Duration::from_millis(token_expires_at.saturating_sub(unix_now_ms()));
        tokio::select! {
            result = read_frame(&mut read_half, MAX_WS_MESSAGE_BYTES) => {
                match result {
                    Ok(f) if !f.fin || f.opcode == Opcode::Continuation => {
                        debug!("Fragmented frame from {}", player_id);
                        let _ = tx.send(Outbound::Close {
                            code: CLOSE_BAD_REQUEST,
                            reason: "fragmented_frame".into(),
                        });
                        break;
                    }
                    Ok(f) => match f.opcode {
                        Opcode::Text => {
                            handle_client_text(&ctx, &session_id, &player_id, &f.payload).await;
                        }
                        Opcode::Binary => {
                            let _ = tx.send(Outbound::Close {
                                code: CLOSE_BAD_REQUEST,
                                reason: "binary_not_supported".into(),
                            });
                            break;
                        }
                        Opcode::Ping => {
                            let _ = tx.send(Outbound::Pong(f.payload));
                        }
                        Opcode::Pong => (),
                        Opcode::Close => {
                            let _ = tx.send(Outbound::Close {
                                code: CLOSE_NORMAL,
                                reason: String::new(),
                            });
                            break;
                        }
                        Opcode::Continuation => unreachable!("handled above"),
                    },
                    Err(Error::PayloadTooLarge) => {
                        let _ = tx.send(Outbound::Close {
                            code: CLOSE_BAD_REQUEST,
                            reason: "payload_too_large".into(),
                        });
                        break;
                    }
                    Err(Error::MalformedMessage(reason)) => {
                        debug!("Protocol error from {}: {}", player_id, reason);
                        let _ = tx.send(Outbound::Close {
                            code: CLOSE_BAD_REQUEST,
                            reason: "protocol_error".into(),
                        });
                        break;
                    }
                    Err(_) => break,
                }
            }
            _ = tokio::time::sleep(until_expiry) => {
                // Guaranteed closure once the access token lapses.
                let message = ServerMessage::Error {
                    session_id: session_id.clone(),
                    timestamp: unix_now_ms(),
                    source: MessageSource::Server,
                    code: "session_expired".into(),
                    reason: "access_token_expired".into(),
                };
                if let Ok(text) = serde_json::to_string(&message) {
                    let _ = tx.send(Outbound::Text(text));
                }
                let _ = tx.send(Outbound::Close {
                    code: CLOSE_UNAUTHORIZED,
                    reason: "session_expired".into(),
                });
                break;
            }
        }
    }

    ctx.on_disconnect(&session_id, conn_id).await;
    drop(tx);
    let _ = writer.await;
    info!("Socket closed: {} in {}", player_id, session_id);
}

async fn handle_client_text(
    ctx: &Arc<ApplicationContext>,
    session_id: &str,
    player_id: &str,
    payload: &[u8],
) {
    let message: ClientMessage = match serde_json::from_slice(payload) {
        Ok(message) => message,
        Err(e) => {
            debug!("Unparsable message from {}: {}", player_id, e);
            send_error_and_resync(ctx, session_id, player_id, "invalid_message", "malformed_message")
                .await;
            return;
        }
    };

    let now = unix_now_ms();
    match message {
        // Opaque passthrough, fanned out untouched.
        ClientMessage::ChaosAttack { body } => {
            ctx.relay_passthrough(
                session_id,
                player_id,
                ServerMessage::ChaosAttack {
                    session_id: session_id.to_owned(),
                    timestamp: now,
                    source: MessageSource::Player,
                    body,
                },
            )
            .await;
        }
        ClientMessage::ParticleEmit { body } => {
            ctx.relay_passthrough(
                session_id,
                player_id,
                ServerMessage::ParticleEmit {
                    session_id: session_id.to_owned(),
                    timestamp: now,
                    source: MessageSource::Player,
                    body,
                },
            )
            .await;
        }
        // Passthrough with server-stamped identity fields.
        ClientMessage::GameUpdate { mut body } => {
            crate::bots::annotate_passthrough(&mut body, player_id);
            ctx.relay_passthrough(
                session_id,
                player_id,
                ServerMessage::GameUpdate {
                    session_id: session_id.to_owned(),
                    timestamp: now,
                    source: MessageSource::Player,
                    body,
                },
            )
            .await;
        }
        ClientMessage::PlayerNotification { mut body } => {
            crate::bots::annotate_passthrough(&mut body, player_id);
            ctx.relay_passthrough(
                session_id,
                player_id,
                ServerMessage::PlayerNotification {
                    session_id: session_id.to_owned(),
                    timestamp: now,
                    source: MessageSource::Player,
                    body,
                },
            )
            .await;
        }
        ClientMessage::TurnAction {
            action: TurnActionKind::Roll,
            roll,
            ..
        } => {
            let result = match roll {
                Some(request) => {
                    ctx.turn_roll(session_id, player_id, &request, MessageSource::Player)
                        .await
                }
                None => Err(Error::InvalidRollPayload("missing roll body".into())),
            };
            if let Err(e) = result {
                send_error_and_resync(
                    ctx,
                    session_id,
                    player_id,
                    "turn_action_invalid_roll",
                    e.reason(),
                )
                .await;
            }
        }
        ClientMessage::TurnAction {
            action: TurnActionKind::Score,
            score,
            ..
        } => {
            let result = match score {
                Some(request) => {
                    ctx.turn_score(session_id, player_id, &request, MessageSource::Player)
                        .await
                }
                None => Err(Error::MissingSelectedDice),
            };
            if let Err(e) = result {
                send_error_and_resync(
                    ctx,
                    session_id,
                    player_id,
                    "turn_action_invalid_score",
                    e.reason(),
                )
                .await;
            }
        }
        ClientMessage::TurnEnd { .. } => {
            if let Err(e) = ctx
                .turn_end(session_id, player_id, MessageSource::Player)
                .await
            {
                send_error_and_resync(ctx, session_id, player_id, "turn_end_invalid", e.reason())
                    .await;
            }
        }
    }
}

/// Invalid payloads get an error frame and a fresh resync pair.
async fn send_error_and_resync(
    ctx: &Arc<ApplicationContext>,
    session_id: &str,
    player_id: &str,
    code: &str,
    reason: &str,
) {
    ctx.hub.send_to(
        session_id,
        player_id,
        &ServerMessage::Error {
            session_id: session_id.to_owned(),
            timestamp: unix_now_ms(),
            source: MessageSource::Server,
            code: code.to_owned(),
            reason: reason.to_owned(),
        },
    );
    ctx.resync_client(session_id, player_id).await;
}
