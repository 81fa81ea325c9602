//! The identity verifier.
//!
//! Resolves a third-party bearer token to claims. The native path decodes
//! the token locally and checks audience and issuer against the configured
//! project; the fallback path asks the provider's lookup endpoint over
//! HTTP. Successful verifications are cached until shortly before the
//! token's own expiry. Failures surface as normalized reason codes, never
//! raw error text.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use serde_json::Value;
use tracing::{debug, warn};

use tumble_core::error::{Error, Result};
use tumble_core::unix_now_ms;
use tumble_env::IdentityConfig;

const CACHE_SKEW_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityClaims {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub is_anonymous: bool,
    pub provider: String,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    StrictNative,
    FallbackHttp,
    Auto,
}

impl IdentityMode {
    fn from_config(raw: &str) -> Self {
        match raw {
            "strict-native" => IdentityMode::StrictNative,
            "fallback-http" => IdentityMode::FallbackHttp,
            _ => IdentityMode::Auto,
        }
    }
}

pub struct IdentityVerifier {
    mode: IdentityMode,
    project_id: Option<String>,
    verify_url: Option<String>,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, IdentityClaims>>,
}

impl IdentityVerifier {
    pub fn new(config: &IdentityConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            mode: IdentityMode::from_config(&config.mode),
            project_id: config.project_id.clone(),
            verify_url: config.verify_url.clone(),
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<IdentityClaims> {
        let now = unix_now_ms();
        if let Some(claims) = self.cached(token, now) {
            return Ok(claims);
        }

        let claims = match self.mode {
            IdentityMode::StrictNative => self.verify_native(token, now)?,
            IdentityMode::FallbackHttp => self.verify_http(token, now).await?,
            IdentityMode::Auto => match self.verify_native(token, now) {
                Ok(claims) => claims,
                Err(Error::IdentityUnavailable(_)) => self.verify_http(token, now).await?,
                Err(e) => return Err(e),
            },
        };

        let cache_until = claims.expires_at.saturating_sub(CACHE_SKEW_MS);
        if cache_until > now {
            self.cache
                .lock()
                .expect("identity cache poisoned")
                .insert(token.to_owned(), claims.clone());
        }
        Ok(claims)
    }

    fn cached(&self, token: &str, now: u64) -> Option<IdentityClaims> {
        let mut cache = self.cache.lock().expect("identity cache poisoned");
        match cache.get(token) {
            Some(claims) if claims.expires_at.saturating_sub(CACHE_SKEW_MS) > now => {
                Some(claims.clone())
            }
            Some(_) => {
                cache.remove(token);
                None
            }
            None => None,
        }
    }

    /// Decode the token payload locally and validate audience and issuer.
    fn verify_native(&self, token: &str, now: u64) -> Result<IdentityClaims> {
        let project_id = self
            .project_id
            .as_deref()
            .ok_or_else(|| Error::IdentityUnavailable("identity_not_configured".into()))?;

        let payload = decode_token_payload(token)
            .ok_or_else(|| Error::IdentityRejected("identity_token_malformed".into()))?;

        let aud = payload.get("aud").and_then(Value::as_str).unwrap_or("");
        let iss = payload.get("iss").and_then(Value::as_str).unwrap_or("");
        if aud != project_id || !iss.ends_with(project_id) {
            return Err(Error::IdentityRejected("identity_audience_mismatch".into()));
        }

        let expires_at = payload
            .get("exp")
            .and_then(Value::as_u64)
            .map(|s| s * 1000)
            .unwrap_or(0);
        if expires_at <= now {
            return Err(Error::IdentityRejected("identity_token_expired".into()));
        }

        let uid = payload
            .get("sub")
            .or_else(|| payload.get("user_id"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::IdentityRejected("identity_token_malformed".into()))?;

        let provider = payload
            .get("firebase")
            .and_then(|f| f.get("sign_in_provider"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();

        Ok(IdentityClaims {
            uid: uid.to_owned(),
            email: payload
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_owned),
            display_name: payload
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_owned),
            is_anonymous: provider == "anonymous",
            provider,
            expires_at,
        })
    }

    /// Ask the provider's lookup endpoint. Bounded by the client timeout.
    async fn verify_http(&self, token: &str, now: u64) -> Result<IdentityClaims> {
        let url = self
            .verify_url
            .as_deref()
            .ok_or_else(|| Error::IdentityUnavailable("identity_not_configured".into()))?;

        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| {
                debug!("Identity lookup failed: {}", e);
                Error::IdentityUnavailable("identity_lookup_failed".into())
            })?;

        if !response.status().is_success() {
            warn!("Identity lookup rejected with {}", response.status());
            return Err(Error::IdentityRejected("identity_rejected".into()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|_| Error::IdentityUnavailable("identity_lookup_failed".into()))?;

        let uid = body
            .get("uid")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::IdentityRejected("identity_rejected".into()))?;
        let expires_at = body
            .get("expiresAt")
            .and_then(Value::as_u64)
            .unwrap_or(now + CACHE_SKEW_MS);

        Ok(IdentityClaims {
            uid: uid.to_owned(),
            email: body.get("email").and_then(Value::as_str).map(str::to_owned),
            display_name: body
                .get("displayName")
                .and_then(Value::as_str)
                .map(str::to_owned),
            is_anonymous: body
                .get("isAnonymous")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            provider: body
                .get("provider")
                .and_then(Value::as_str)
                .unwrap_or("http")
                .to_owned(),
            expires_at,
        })
    }
}

/// JWT-shaped tokens carry their claims in the middle base64url segment.
fn decode_token_payload(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let _signature = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}
