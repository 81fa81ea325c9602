//! HTTP handlers. Thin: parse, authorize, call into the context or the
//! state under its lock, answer JSON.

use std::sync::Arc;

use hyper::{Body, Request, Response, StatusCode};
use serde_json::Value;
use uuid::Uuid;

use tumble_core::error::{Error, Result};
use tumble_core::params::{
    CreateSessionParams, GameLogInput, HealthResponse, JoinSessionParams, LeaveSessionParams,
    LogBatchParams, LogBatchRejection, LogBatchResponse, MeResponse, RefreshTokenParams,
    SessionAuthRefreshParams, SubmitScoreParams, UpdateMeParams,
};
use tumble_core::state::{GameLogEntry, ExternalPlayerRecord, LeaderboardEntry, PlayerProfileRecord};
use tumble_core::unix_now_ms;

use crate::context::ApplicationContext;
use crate::http::{bearer_token, json_response, query_param, read_json_body};
use crate::identity::IdentityClaims;

const MAX_DISPLAY_NAME_LEN: usize = 32;
const DEFAULT_LEADERBOARD_LIMIT: usize = 100;

type Ctx = Arc<ApplicationContext>;

pub async fn health(ctx: &Ctx) -> Result<Response<Body>> {
    let state = ctx.state().lock().await;
    let body = HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.multiplayer_sessions.len(),
        players: state.players.len(),
        access_tokens: state.access_tokens.len(),
        refresh_tokens: state.refresh_tokens.len(),
        leaderboard_scores: state.leaderboard_scores.len(),
        game_logs: state.game_logs.len(),
    };
    Ok(json_response(StatusCode::OK, &body))
}

pub async fn auth_token_refresh(ctx: &Ctx, req: Request<Body>) -> Result<Response<Body>> {
    let params: RefreshTokenParams = read_json_body(req).await?;
    let now = unix_now_ms();
    let bundle = {
        let mut state = ctx.state().lock().await;
        ctx.vault.refresh(&mut state, &params.refresh_token, now)?
    };
    ctx.persist().await;
    Ok(json_response(StatusCode::OK, &bundle))
}

async fn identity_claims(ctx: &Ctx, req: &Request<Body>) -> Result<IdentityClaims> {
    let token = bearer_token(req)?;
    ctx.identity.verify(&token).await
}

fn me_response(record: &ExternalPlayerRecord, claims: &IdentityClaims) -> MeResponse {
    MeResponse {
        uid: record.uid.clone(),
        display_name: record.display_name.clone(),
        email: record.email.clone().or_else(|| claims.email.clone()),
        is_anonymous: claims.is_anonymous,
    }
}

pub async fn auth_me_get(ctx: &Ctx, req: Request<Body>) -> Result<Response<Body>> {
    let claims = identity_claims(ctx, &req).await?;
    let now = unix_now_ms();
    let body = {
        let mut state = ctx.state().lock().await;
        let record = state
            .firebase_players
            .entry(claims.uid.clone())
            .or_insert_with(|| ExternalPlayerRecord {
                uid: claims.uid.clone(),
                display_name: claims.display_name.clone(),
                email: claims.email.clone(),
                updated_at: now,
            });
        me_response(record, &claims)
    };
    ctx.persist().await;
    Ok(json_response(StatusCode::OK, &body))
}

pub async fn auth_me_put(ctx: &Ctx, req: Request<Body>) -> Result<Response<Body>> {
    let claims = identity_claims(ctx, &req).await?;
    let params: UpdateMeParams = read_json_body(req).await?;
    let display_name = params.display_name.trim().to_owned();
    if display_name.is_empty() || display_name.len() > MAX_DISPLAY_NAME_LEN {
        return Err(Error::InvalidParams("invalid display name".into()));
    }
    let now = unix_now_ms();
    let body = {
        let mut state = ctx.state().lock().await;
        let record = state
            .firebase_players
            .entry(claims.uid.clone())
            .or_insert_with(|| ExternalPlayerRecord {
                uid: claims.uid.clone(),
                display_name: None,
                email: claims.email.clone(),
                updated_at: now,
            });
        record.display_name = Some(display_name);
        record.updated_at = now;
        me_response(record, &claims)
    };
    ctx.persist().await;
    Ok(json_response(StatusCode::OK, &body))
}

/// A session bearer is optional here, but when present it must belong to
/// the player in the path.
async fn check_optional_session_bearer(
    ctx: &Ctx,
    req: &Request<Body>,
    player_id: &str,
) -> Result<()> {
    let Ok(token) = bearer_token(req) else {
        return Ok(());
    };
    let now = unix_now_ms();
    let mut state = ctx.state().lock().await;
    let record = ctx
        .vault
        .verify_access(&mut state, &token, now)
        .ok_or_else(|| Error::Unauthorized("invalid access token".into()))?;
    if record.player_id != player_id {
        return Err(Error::Forbidden);
    }
    Ok(())
}

pub async fn player_profile_get(
    ctx: &Ctx,
    req: Request<Body>,
    player_id: &str,
) -> Result<Response<Body>> {
    check_optional_session_bearer(ctx, &req, player_id).await?;
    let state = ctx.state().lock().await;
    match state.players.get(player_id) {
        Some(record) => Ok(json_response(StatusCode::OK, record)),
        None => Ok(crate::http::empty_response(StatusCode::NO_CONTENT)),
    }
}

pub async fn player_profile_put(
    ctx: &Ctx,
    req: Request<Body>,
    player_id: &str,
) -> Result<Response<Body>> {
    check_optional_session_bearer(ctx, &req, player_id).await?;
    let data: Value = read_json_body(req).await?;
    let now = unix_now_ms();
    let record = PlayerProfileRecord {
        player_id: player_id.to_owned(),
        updated_at: now,
        data,
    };
    {
        let mut state = ctx.state().lock().await;
        state.players.insert(player_id.to_owned(), record.clone());
    }
    ctx.persist().await;
    Ok(json_response(StatusCode::OK, &record))
}

pub async fn logs_batch(ctx: &Ctx, req: Request<Body>) -> Result<Response<Body>> {
    // the bearer is optional; a present one must at least verify
    if let Ok(token) = bearer_token(&req) {
        let now = unix_now_ms();
        let mut state = ctx.state().lock().await;
        ctx.vault
            .verify_access(&mut state, &token, now)
            .ok_or_else(|| Error::Unauthorized("invalid access token".into()))?;
    }

    let params: LogBatchParams = read_json_body(req).await?;
    let now = unix_now_ms();
    let mut accepted = 0;
    let mut failed = vec![];
    {
        let mut state = ctx.state().lock().await;
        for (index, entry) in params.entries.into_iter().enumerate() {
            match validate_log_entry(entry, now) {
                Ok(entry) => {
                    state.insert_game_log(entry);
                    accepted += 1;
                }
                Err(reason) => failed.push(LogBatchRejection { index, reason }),
            }
        }
    }
    ctx.persist().await;
    Ok(json_response(
        StatusCode::OK,
        &LogBatchResponse { accepted, failed },
    ))
}

fn validate_log_entry(input: GameLogInput, now: u64) -> std::result::Result<GameLogEntry, String> {
    let message = input.message.unwrap_or_default();
    if message.trim().is_empty() {
        return Err("empty message".into());
    }
    if message.len() > 2048 {
        return Err("message too long".into());
    }
    Ok(GameLogEntry {
        id: Uuid::new_v4().to_string(),
        session_id: input.session_id,
        player_id: input.player_id,
        level: input.level,
        message,
        timestamp: input.timestamp.unwrap_or(now),
    })
}

pub async fn leaderboard_submit(ctx: &Ctx, req: Request<Body>) -> Result<Response<Body>> {
    let claims = identity_claims(ctx, &req).await?;
    if claims.is_anonymous {
        return Err(Error::Forbidden);
    }
    let params: SubmitScoreParams = read_json_body(req).await?;
    let now = unix_now_ms();

    let entry = {
        let mut state = ctx.state().lock().await;
        let display_name = match params
            .display_name
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
        {
            Some(name) => name,
            None => state
                .firebase_players
                .get(&claims.uid)
                .and_then(|r| r.display_name.clone())
                .or_else(|| claims.display_name.clone())
                .ok_or_else(|| Error::InvalidParams("displayName is required".into()))?,
        };
        if display_name.len() > MAX_DISPLAY_NAME_LEN {
            return Err(Error::InvalidParams("invalid display name".into()));
        }

        // one display name per uid, and no squatting on someone else's
        let taken = state
            .firebase_players
            .values()
            .any(|r| r.uid != claims.uid && r.display_name.as_deref() == Some(&display_name));
        if taken {
            return Err(Error::DisplayNameTaken);
        }
        let record = state
            .firebase_players
            .entry(claims.uid.clone())
            .or_insert_with(|| ExternalPlayerRecord {
                uid: claims.uid.clone(),
                display_name: None,
                email: claims.email.clone(),
                updated_at: now,
            });
        record.display_name = Some(display_name.clone());
        record.updated_at = now;

        let entry = LeaderboardEntry {
            id: Uuid::new_v4().to_string(),
            uid: claims.uid.clone(),
            display_name,
            score: params.score,
            duration_ms: params.duration_ms,
            rolls: params.rolls,
            timestamp: now,
        };
        state.insert_leaderboard_entry(entry.clone());
        entry
    };
    ctx.persist().await;
    Ok(json_response(StatusCode::CREATED, &entry))
}

pub async fn leaderboard_global(ctx: &Ctx, req: Request<Body>) -> Result<Response<Body>> {
    let limit = query_param(&req, "limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_LEADERBOARD_LIMIT);
    let state = ctx.state().lock().await;
    let entries: Vec<&LeaderboardEntry> = state
        .ranked_leaderboard()
        .into_iter()
        .take(limit)
        .collect();
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "entries": entries }),
    ))
}

pub async fn create_session(ctx: &Ctx, req: Request<Body>) -> Result<Response<Body>> {
    let params: CreateSessionParams = read_json_body(req).await?;
    let response = ctx.create_session(&params).await?;
    Ok(json_response(StatusCode::CREATED, &response))
}

pub async fn list_rooms(ctx: &Ctx, req: Request<Body>) -> Result<Response<Body>> {
    let limit = query_param(&req, "limit").and_then(|v| v.parse::<usize>().ok());
    let rooms = ctx.list_rooms(limit).await;
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "rooms": rooms }),
    ))
}

pub async fn join_room_by_code(
    ctx: &Ctx,
    req: Request<Body>,
    code: &str,
) -> Result<Response<Body>> {
    let params: JoinSessionParams = read_json_body(req).await?;
    let response = ctx.join_room_by_code(code, &params).await?;
    Ok(json_response(StatusCode::OK, &response))
}

pub async fn join_session(
    ctx: &Ctx,
    req: Request<Body>,
    session_id: &str,
) -> Result<Response<Body>> {
    let params: JoinSessionParams = read_json_body(req).await?;
    let response = ctx.join_session_by_id(session_id, &params).await?;
    Ok(json_response(StatusCode::OK, &response))
}

pub async fn heartbeat(ctx: &Ctx, req: Request<Body>, session_id: &str) -> Result<Response<Body>> {
    let token = bearer_token(&req)?;
    let response = ctx.heartbeat(session_id, &token).await?;
    Ok(json_response(StatusCode::OK, &response))
}

pub async fn leave_session(
    ctx: &Ctx,
    req: Request<Body>,
    session_id: &str,
) -> Result<Response<Body>> {
    let params: LeaveSessionParams = read_json_body(req).await?;
    ctx.leave_session(session_id, &params.player_id).await?;
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "left": true }),
    ))
}

pub async fn refresh_session_auth(
    ctx: &Ctx,
    req: Request<Body>,
    session_id: &str,
) -> Result<Response<Body>> {
    let params: SessionAuthRefreshParams = read_json_body(req).await?;
    let response = ctx.refresh_session_auth(session_id, &params.player_id).await?;
    Ok(json_response(StatusCode::OK, &response))
}
