//! Access-token refresh with single-flight coalescing
//!
//! Every caller that needs a token goes through
//! [`Refresher::get_valid_access_token`]. When the stored access token is
//! stale, the first caller installs a shared refresh future and everyone
//! arriving before it settles awaits that same future, so the refresh
//! endpoint sees one call per expiry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::tokens::{is_expired_with_buffer, is_refresh_token_expired};
use super::{TokenPair, TokenStore};

type SharedRefresh = Shared<BoxFuture<'static, Option<String>>>;

/// Refresh endpoint did not produce a new token pair.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("refresh request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("refresh response could not be parsed: {0}")]
    Body(#[source] reqwest::Error),
    #[error("refresh did not complete within {0:?}")]
    Timeout(Duration),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Owner of the stored credentials.
#[derive(Clone)]
pub struct Refresher {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    refresh_url: Url,
    store: Arc<dyn TokenStore>,
    expiry_buffer: Duration,
    refresh_timeout: Duration,
    in_flight: Mutex<Option<SharedRefresh>>,
}

impl Refresher {
    pub fn new(
        http: reqwest::Client,
        refresh_url: Url,
        store: Arc<dyn TokenStore>,
        expiry_buffer: Duration,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                refresh_url,
                store,
                expiry_buffer,
                refresh_timeout,
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn refresh_url(&self) -> &Url {
        &self.inner.refresh_url
    }

    /// Margin before `exp` at which an access token is treated as expired.
    pub fn expiry_buffer(&self) -> Duration {
        self.inner.expiry_buffer
    }

    pub fn store_tokens(&self, tokens: &TokenPair) {
        self.inner.store.set_tokens(tokens);
    }

    pub fn stored_tokens(&self) -> Option<TokenPair> {
        self.inner.store.tokens()
    }

    pub fn clear_tokens(&self) {
        self.inner.store.clear_tokens();
    }

    /// Exchange a refresh token for a new pair. Does not touch the store.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        self.inner.refresh(refresh_token).await
    }

    /// A currently usable access token, refreshing if needed.
    ///
    /// `None` means the session is gone: nothing was stored, the refresh
    /// token expired, or the refresh failed. In the last two cases the
    /// store has been cleared.
    pub async fn get_valid_access_token(&self) -> Option<String> {
        self.valid_token(None).await
    }

    /// Like [`get_valid_access_token`](Self::get_valid_access_token), but a
    /// stored access token equal to `rejected` counts as expired: the server
    /// has refused it regardless of its `exp`.
    pub async fn replace_rejected_token(&self, rejected: &str) -> Option<String> {
        self.valid_token(Some(rejected)).await
    }

    async fn valid_token(&self, rejected: Option<&str>) -> Option<String> {
        let refresh_token = match self.check_stored(rejected) {
            Stored::Usable(access) => return Some(access),
            Stored::Gone => return None,
            Stored::Stale(refresh_token) => refresh_token,
        };

        let refresh = {
            let mut slot = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.clone() {
                Some(in_flight) => {
                    tracing::debug!("Joining in-flight token refresh");
                    in_flight
                }
                None => {
                    // A refresh may have settled since the first read; its
                    // result is in the store before the slot empties.
                    let refresh_token = match self.check_stored(rejected) {
                        Stored::Usable(access) => return Some(access),
                        Stored::Gone => return None,
                        Stored::Stale(current) => {
                            if current != refresh_token {
                                tracing::debug!("Refresh token rotated since first read");
                            }
                            current
                        }
                    };
                    let inner = Arc::clone(&self.inner);
                    let refresh = async move { inner.refresh_and_store(refresh_token).await }
                        .boxed()
                        .shared();
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await
    }

    fn check_stored(&self, rejected: Option<&str>) -> Stored {
        let store = &self.inner.store;
        let (access_token, refresh_token) = match (store.access_token(), store.refresh_token()) {
            (Some(access), Some(refresh)) => (access, refresh),
            _ => return Stored::Gone,
        };

        let refused = rejected == Some(access_token.as_str());
        if !refused && !is_expired_with_buffer(&access_token, self.inner.expiry_buffer) {
            return Stored::Usable(access_token);
        }

        if is_refresh_token_expired(&refresh_token) {
            tracing::info!("Refresh token expired, clearing session");
            store.clear_tokens();
            return Stored::Gone;
        }

        Stored::Stale(refresh_token)
    }
}

/// What the store holds for a caller that wants a token.
enum Stored {
    Usable(String),
    Gone,
    Stale(String),
}

impl Inner {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        let call = async {
            let resp = self
                .http
                .post(self.refresh_url.clone())
                .json(&RefreshRequest { refresh_token })
                .send()
                .await
                .map_err(RefreshError::Transport)?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(RefreshError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let body: RefreshResponse = resp.json().await.map_err(RefreshError::Body)?;
            Ok(TokenPair {
                access_token: body.access_token,
                refresh_token: body
                    .refresh_token
                    .unwrap_or_else(|| refresh_token.to_string()),
            })
        };

        tokio::time::timeout(self.refresh_timeout, call)
            .await
            .map_err(|_| RefreshError::Timeout(self.refresh_timeout))?
    }

    async fn refresh_and_store(&self, refresh_token: String) -> Option<String> {
        tracing::info!("Refreshing access token...");

        let token = match self.refresh(&refresh_token).await {
            Ok(tokens) => {
                self.store.set_tokens(&tokens);
                tracing::info!("Access token refreshed");
                Some(tokens.access_token)
            }
            Err(e) => {
                tracing::warn!("Token refresh failed, clearing session: {}", e);
                self.store.clear_tokens();
                None
            }
        };

        // Store is updated before the slot opens, so late callers see the new token.
        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()) = None;
        token
    }
}
