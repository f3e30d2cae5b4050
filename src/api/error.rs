//! Client error types

use thiserror::Error;

/// Errors returned by [`ApiClient`](super::ApiClient).
#[derive(Debug, Error)]
pub enum ApiError {
    /// Server answered with a non-success status
    #[error("HTTP {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// Request went out but no response came back
    #[error("No response from {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Request could not be built or sent
    #[error("Could not send request to {url}: {reason}")]
    RequestSetup { url: String, reason: String },

    /// A shared token refresh failed while this request was waiting on it
    #[error("Session expired; log in again")]
    SessionExpired,

    /// Response body was not the expected JSON
    #[error("Unexpected response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid client configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl ApiError {
    pub(crate) fn from_transport(url: &str, err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::RequestSetup {
                url: url.to_string(),
                reason: err.to_string(),
            }
        } else {
            Self::Network {
                url: url.to_string(),
                source: err,
            }
        }
    }

    /// HTTP status, if the server responded.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for 401 responses and failed shared refreshes.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, Self::SessionExpired) || self.status() == Some(401)
    }
}
