//! Route-level tests against the HTTP surface.

use std::sync::Arc;

use base64::Engine;
use hyper::{header, Body, Method, Request, StatusCode};
use serde_json::{json, Value};

use tumble_env::Config;
use tumble_server::context::ApplicationContext;
use tumble_server::http;

fn test_config() -> Config {
    let mut config = Config::default();
    config.store.backend = "memory".into();
    config.identity.mode = "strict-native".into();
    config.identity.project_id = Some("tumble-test".into());
    config
}

async fn new_ctx() -> Arc<ApplicationContext> {
    let (ctx, _signal_loop) = ApplicationContext::try_new_and_start_signal_loop(test_config())
        .await
        .expect("context init");
    ctx
}

async fn send(
    ctx: &Arc<ApplicationContext>,
    method: Method,
    path: &str,
    body: Option<Value>,
    bearer: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = http::route(ctx.clone(), request).await;
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// An unsigned JWT-shaped identity token the native verifier accepts.
fn identity_token(uid: &str, provider: &str) -> String {
    let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = engine.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let exp = tumble_core::unix_now_ms() / 1000 + 3600;
    let payload = engine.encode(
        json!({
            "aud": "tumble-test",
            "iss": "https://securetoken.example.com/tumble-test",
            "sub": uid,
            "exp": exp,
            "name": format!("Player {uid}"),
            "firebase": {"sign_in_provider": provider},
        })
        .to_string(),
    );
    format!("{header}.{payload}.sig")
}

#[tokio::test]
async fn test_health_reports_counts() {
    let ctx = new_ctx().await;
    let (status, body) = send(&ctx, Method::GET, "/api/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    // boot reconciliation seeds the public inventory
    assert!(body["sessions"].as_u64().unwrap() >= 6);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let ctx = new_ctx().await;
    let (status, body) = send(&ctx, Method::GET, "/api/nope", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "room_not_found");
}

#[tokio::test]
async fn test_create_then_join_by_code() {
    let ctx = new_ctx().await;
    let (status, created) = send(
        &ctx,
        Method::POST,
        "/api/multiplayer/sessions",
        Some(json!({"playerId": "p1", "botCount": 0})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let code = created["roomCode"].as_str().unwrap();
    assert!(created["auth"]["accessToken"].is_string());
    assert!(created["wsUrl"].as_str().unwrap().contains("session="));

    let (status, joined) = send(
        &ctx,
        Method::POST,
        &format!("/api/multiplayer/rooms/{code}/join"),
        Some(json!({"playerId": "p2"})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(joined["sessionId"], created["sessionId"]);

    let (status, body) = send(
        &ctx,
        Method::POST,
        "/api/multiplayer/rooms/ZZZZZZ/join",
        Some(json!({"playerId": "p3"})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "room_not_found");
}

#[tokio::test]
async fn test_refresh_token_is_single_use() {
    let ctx = new_ctx().await;
    let (_, created) = send(
        &ctx,
        Method::POST,
        "/api/multiplayer/sessions",
        Some(json!({"playerId": "p1", "botCount": 0})),
        None,
    )
    .await;
    let r1 = created["auth"]["refreshToken"].as_str().unwrap().to_owned();

    let (status, rotated) = send(
        &ctx,
        Method::POST,
        "/api/auth/token/refresh",
        Some(json!({"refreshToken": r1})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let r2 = rotated["refreshToken"].as_str().unwrap().to_owned();
    assert_ne!(r1, r2);

    // the consumed token is dead
    let (status, body) = send(
        &ctx,
        Method::POST,
        "/api/auth/token/refresh",
        Some(json!({"refreshToken": r1})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["reason"], "unauthorized");

    // the new one rotates exactly once more
    let (status, _) = send(
        &ctx,
        Method::POST,
        "/api/auth/token/refresh",
        Some(json!({"refreshToken": r2})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_heartbeat_requires_matching_session_token() {
    let ctx = new_ctx().await;
    let (_, created) = send(
        &ctx,
        Method::POST,
        "/api/multiplayer/sessions",
        Some(json!({"playerId": "p1", "botCount": 0})),
        None,
    )
    .await;
    let sid = created["sessionId"].as_str().unwrap().to_owned();
    let access = created["auth"]["accessToken"].as_str().unwrap().to_owned();

    let (status, body) = send(
        &ctx,
        Method::POST,
        &format!("/api/multiplayer/sessions/{sid}/heartbeat"),
        Some(json!({})),
        Some(&access),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["expiresAt"].as_u64().unwrap() > 0);

    let (status, _) = send(
        &ctx,
        Method::POST,
        &format!("/api/multiplayer/sessions/{sid}/heartbeat"),
        Some(json!({})),
        Some("garbage"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &ctx,
        Method::POST,
        &format!("/api/multiplayer/sessions/{sid}/heartbeat"),
        Some(json!({})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_join_expired_session_is_410() {
    let ctx = new_ctx().await;
    let (_, created) = send(
        &ctx,
        Method::POST,
        "/api/multiplayer/sessions",
        Some(json!({"playerId": "p1", "botCount": 0})),
        None,
    )
    .await;
    let sid = created["sessionId"].as_str().unwrap().to_owned();
    {
        let mut state = ctx.state().lock().await;
        state
            .multiplayer_sessions
            .get_mut(&sid)
            .unwrap()
            .expires_at = 1;
    }
    let (status, body) = send(
        &ctx,
        Method::POST,
        &format!("/api/multiplayer/sessions/{sid}/join"),
        Some(json!({"playerId": "p2"})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["reason"], "session_expired");
}

#[tokio::test]
async fn test_leaderboard_rejects_anonymous() {
    let ctx = new_ctx().await;
    let token = identity_token("anon-1", "anonymous");
    let (status, body) = send(
        &ctx,
        Method::POST,
        "/api/leaderboard/scores",
        Some(json!({"score": 12, "durationMs": 30000, "rolls": 9})),
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "forbidden");
}

#[tokio::test]
async fn test_leaderboard_submit_and_global_order() {
    let ctx = new_ctx().await;
    let alice = identity_token("uid-alice", "password");
    let bob = identity_token("uid-bob", "password");

    let (status, _) = send(
        &ctx,
        Method::POST,
        "/api/leaderboard/scores",
        Some(json!({"score": 20, "durationMs": 40000, "rolls": 12, "displayName": "Alice"})),
        Some(&alice),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(
        &ctx,
        Method::POST,
        "/api/leaderboard/scores",
        Some(json!({"score": 8, "durationMs": 60000, "rolls": 10, "displayName": "Bob"})),
        Some(&bob),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Bob cannot take Alice's name
    let (status, body) = send(
        &ctx,
        Method::POST,
        "/api/leaderboard/scores",
        Some(json!({"score": 5, "durationMs": 1000, "rolls": 3, "displayName": "Alice"})),
        Some(&bob),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "display_name_taken");

    let (status, body) = send(&ctx, Method::GET, "/api/leaderboard/global", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    // lower score ranks first
    assert_eq!(entries[0]["displayName"], "Bob");
}

#[tokio::test]
async fn test_profile_upsert_and_read() {
    let ctx = new_ctx().await;
    let (status, _) = send(
        &ctx,
        Method::PUT,
        "/api/players/p7/profile",
        Some(json!({"settings": {"sound": false}, "unlocks": ["golden_die"]})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&ctx, Method::GET, "/api/players/p7/profile", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["settings"]["sound"], false);

    let (status, body) = send(&ctx, Method::GET, "/api/players/p8/profile", None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_null());
}

#[tokio::test]
async fn test_logs_batch_accepts_per_entry() {
    let ctx = new_ctx().await;
    let (status, body) = send(
        &ctx,
        Method::POST,
        "/api/logs/batch",
        Some(json!({"entries": [
            {"message": "round started", "sessionId": "s1"},
            {"message": "die kept", "playerId": "p1"},
            {"message": ""},
        ]})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], 2);
    assert_eq!(body["failed"][0]["index"], 2);
}

#[tokio::test]
async fn test_auth_me_roundtrip() {
    let ctx = new_ctx().await;
    let token = identity_token("uid-me", "password");

    let (status, body) = send(&ctx, Method::GET, "/api/auth/me", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uid"], "uid-me");

    let (status, body) = send(
        &ctx,
        Method::PUT,
        "/api/auth/me",
        Some(json!({"displayName": "Dicemaster"})),
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["displayName"], "Dicemaster");

    let (status, _) = send(&ctx, Method::GET, "/api/auth/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
