//! Credential pair and JWT expiry checks

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Safety margin applied to access tokens, covering the gap between the
/// check and the token reaching the server.
pub const EXPIRY_BUFFER: Duration = Duration::from_secs(30);

/// Access/refresh token pair as persisted and as returned by the auth endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

/// Claims carried in a token payload. Only `exp` is required.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(deserialize_with = "unix_seconds")]
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.iat.and_then(|iat| DateTime::from_timestamp(iat, 0))
    }
}

/// Token payload could not be decoded.
#[derive(Debug, Error)]
pub enum TokenDecodeError {
    #[error("token is not a three-part JWT")]
    Shape,
    #[error("token payload is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("token payload is not valid claims JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// Some issuers emit `exp` as a float.
fn unix_seconds<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let n = serde_json::Number::deserialize(deserializer)?;
    n.as_i64()
        .or_else(|| n.as_f64().map(|f| f.floor() as i64))
        .ok_or_else(|| serde::de::Error::custom("exp is not a number"))
}

/// Decode the payload segment of a JWT without verifying its signature.
pub fn decode_claims(token: &str) -> Result<Claims, TokenDecodeError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) if !payload.is_empty() => payload,
        _ => return Err(TokenDecodeError::Shape),
    };
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub(crate) fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// True if the access token expires within [`EXPIRY_BUFFER`] or cannot be decoded.
pub fn is_expired(token: &str) -> bool {
    is_expired_with_buffer(token, EXPIRY_BUFFER)
}

/// True if the refresh token is past its `exp` or cannot be decoded.
pub fn is_refresh_token_expired(token: &str) -> bool {
    is_expired_with_buffer(token, Duration::ZERO)
}

pub fn is_expired_with_buffer(token: &str, buffer: Duration) -> bool {
    is_expired_at(token, now_unix(), buffer)
}

fn is_expired_at(token: &str, now: i64, buffer: Duration) -> bool {
    match decode_claims(token) {
        Ok(claims) => claims.exp <= now.saturating_add(buffer.as_secs() as i64),
        Err(e) => {
            tracing::debug!("Treating undecodable token as expired: {}", e);
            true
        }
    }
}

/// Build an unsigned token whose `exp` is `offset_secs` from now.
#[cfg(test)]
pub(crate) fn test_token(sub: &str, offset_secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let now = now_unix();
    let claims = serde_json::json!({ "sub": sub, "iat": now, "exp": now + offset_secs });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}
