//! Login, logout and session status

use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Serialize;

use super::tokens::{decode_claims, is_expired_with_buffer, is_refresh_token_expired};
use super::TokenPair;
use crate::api::client::{ApiRequest, LOGIN_PATH};
use crate::api::{ApiClient, ApiError};

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Exchange email and password for a token pair and store it.
pub async fn login(client: &ApiClient, email: &str, password: &str) -> Result<TokenPair, ApiError> {
    let request =
        ApiRequest::new(Method::POST, LOGIN_PATH).json(&LoginRequest { email, password })?;
    let resp = client.send(request).await?;

    let url = resp.url().to_string();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ApiError::Network { url: url.clone(), source: e })?;
    let tokens: TokenPair =
        serde_json::from_slice(&bytes).map_err(|source| ApiError::Decode { url, source })?;

    client.refresher().store_tokens(&tokens);
    tracing::info!("Logged in as {}", email);
    Ok(tokens)
}

/// Forget stored credentials.
pub fn logout(client: &ApiClient) {
    client.refresher().clear_tokens();
    tracing::info!("Credentials cleared");
}

/// State of one stored token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    Missing,
    Malformed,
    Valid { expires_at: Option<DateTime<Utc>> },
    Expired { expires_at: Option<DateTime<Utc>> },
}

impl TokenState {
    fn inspect(token: Option<&str>, expired: impl Fn(&str) -> bool) -> Self {
        let Some(token) = token else {
            return Self::Missing;
        };
        match decode_claims(token) {
            Err(_) => Self::Malformed,
            Ok(claims) if expired(token) => Self::Expired {
                expires_at: claims.expires_at(),
            },
            Ok(claims) => Self::Valid {
                expires_at: claims.expires_at(),
            },
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expiry = |at: &Option<DateTime<Utc>>| {
            at.map(|t| format!(" (expires_at: {})", t.to_rfc3339()))
                .unwrap_or_default()
        };
        match self {
            Self::Missing => write!(f, "none"),
            Self::Malformed => write!(f, "malformed"),
            Self::Valid { expires_at } => write!(f, "valid{}", expiry(expires_at)),
            Self::Expired { expires_at } => write!(f, "expired{}", expiry(expires_at)),
        }
    }
}

/// Snapshot of the stored session, decoded locally without network calls.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub subject: Option<String>,
    pub access: TokenState,
    pub refresh: TokenState,
}

impl SessionStatus {
    /// A request made now can authenticate, possibly after a refresh.
    pub fn can_authenticate(&self) -> bool {
        self.refresh.is_valid() && self.access != TokenState::Missing
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Subject:     {}", self.subject.as_deref().unwrap_or("(none)"))?;
        writeln!(f, "Access tok:  {}", self.access)?;
        write!(f, "Refresh tok: {}", self.refresh)
    }
}

/// Inspect the stored credentials.
pub fn status(client: &ApiClient) -> SessionStatus {
    let stored = client.refresher().stored_tokens();
    let access = stored.as_ref().map(|t| t.access_token.as_str());
    let refresh = stored.as_ref().map(|t| t.refresh_token.as_str());
    let buffer = client.refresher().expiry_buffer();

    SessionStatus {
        subject: access
            .and_then(|t| decode_claims(t).ok())
            .and_then(|claims| claims.sub),
        access: TokenState::inspect(access, |t| is_expired_with_buffer(t, buffer)),
        refresh: TokenState::inspect(refresh, is_refresh_token_expired),
    }
}
