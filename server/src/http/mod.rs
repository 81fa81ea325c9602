//! HTTP routing.
//!
//! All API routes live under `/api` and speak JSON. CORS is permissive:
//! every response carries the allow headers and preflights are answered
//! directly. Failures are structured `{error, reason}` bodies.

pub mod handlers;

use std::sync::Arc;

use hyper::{header, Body, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use tumble_core::error::{Error, Result};
use tumble_core::params::ErrorBody;

use crate::context::ApplicationContext;

pub const MAX_BODY_BYTES: usize = 64 * 1024;

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::MissingBearer
        | Error::Unauthorized(_)
        | Error::IdentityRejected(_) => StatusCode::UNAUTHORIZED,
        Error::Forbidden => StatusCode::FORBIDDEN,
        Error::RoomNotFound | Error::SessionNotFound | Error::PlayerNotInSession(_) => {
            StatusCode::NOT_FOUND
        }
        Error::RoomFull(_) | Error::RoomCodeTaken | Error::DisplayNameTaken => {
            StatusCode::CONFLICT
        }
        Error::SessionExpired => StatusCode::GONE,
        Error::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        Error::IdentityUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::StorageError(_) | Error::IoError(_) | Error::InternalError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

fn cors(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "GET, POST, PUT, OPTIONS",
        )
        .header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "content-type, authorization",
        )
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let text = serde_json::to_string(body).unwrap_or_else(|_| "{}".into());
    cors(Response::builder().status(status))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(text))
        .expect("response")
}

pub fn empty_response(status: StatusCode) -> Response<Body> {
    cors(Response::builder().status(status))
        .body(Body::empty())
        .expect("response")
}

pub fn error_response(error: &Error) -> Response<Body> {
    json_response(status_for(error), &ErrorBody::from_error(error))
}

/// Read and decode a JSON body, bounded by [`MAX_BODY_BYTES`].
pub async fn read_json_body<T: DeserializeOwned>(req: Request<Body>) -> Result<T> {
    if let Some(length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > MAX_BODY_BYTES {
            return Err(Error::PayloadTooLarge);
        }
    }
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| Error::InternalError(e.to_string()))?;
    if bytes.len() > MAX_BODY_BYTES {
        return Err(Error::PayloadTooLarge);
    }
    serde_json::from_slice(&bytes).map_err(|e| {
        debug!("Body parse failed: {}", e);
        Error::InvalidParams(e.to_string())
    })
}

/// Value of a single query parameter.
pub fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then(|| value.to_owned())
        })
    })
}

/// Bearer token from the Authorization header.
pub fn bearer_token(req: &Request<Body>) -> Result<String> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
        .ok_or(Error::MissingBearer)
}

pub async fn route(ctx: Arc<ApplicationContext>, req: Request<Body>) -> Response<Body> {
    if req.method() == Method::OPTIONS {
        return empty_response(StatusCode::NO_CONTENT);
    }

    let path = req.uri().path().to_owned();
    let Some(rest) = path.strip_prefix("/api") else {
        return error_response(&Error::RoomNotFound);
    };
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    let method = req.method().clone();

    let result = match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => handlers::health(&ctx).await,
        (Method::POST, ["auth", "token", "refresh"]) => {
            handlers::auth_token_refresh(&ctx, req).await
        }
        (Method::GET, ["auth", "me"]) => handlers::auth_me_get(&ctx, req).await,
        (Method::PUT, ["auth", "me"]) => handlers::auth_me_put(&ctx, req).await,
        (Method::GET, ["players", id, "profile"]) => {
            let id = id.to_string();
            handlers::player_profile_get(&ctx, req, &id).await
        }
        (Method::PUT, ["players", id, "profile"]) => {
            let id = id.to_string();
            handlers::player_profile_put(&ctx, req, &id).await
        }
        (Method::POST, ["logs", "batch"]) => handlers::logs_batch(&ctx, req).await,
        (Method::POST, ["leaderboard", "scores"]) => {
            handlers::leaderboard_submit(&ctx, req).await
        }
        (Method::GET, ["leaderboard", "global"]) => {
            handlers::leaderboard_global(&ctx, req).await
        }
        (Method::POST, ["multiplayer", "sessions"]) => {
            handlers::create_session(&ctx, req).await
        }
        (Method::GET, ["multiplayer", "rooms"]) => handlers::list_rooms(&ctx, req).await,
        (Method::POST, ["multiplayer", "rooms", code, "join"]) => {
            let code = code.to_string();
            handlers::join_room_by_code(&ctx, req, &code).await
        }
        (Method::POST, ["multiplayer", "sessions", id, "join"]) => {
            let id = id.to_string();
            handlers::join_session(&ctx, req, &id).await
        }
        (Method::POST, ["multiplayer", "sessions", id, "heartbeat"]) => {
            let id = id.to_string();
            handlers::heartbeat(&ctx, req, &id).await
        }
        (Method::POST, ["multiplayer", "sessions", id, "leave"]) => {
            let id = id.to_string();
            handlers::leave_session(&ctx, req, &id).await
        }
        (Method::POST, ["multiplayer", "sessions", id, "auth", "refresh"]) => {
            let id = id.to_string();
            handlers::refresh_session_auth(&ctx, req, &id).await
        }
        _ => Err(Error::RoomNotFound),
    };

    match result {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}
