//! Client library for the campus school-management API
//!
//! [`api::ApiClient`] attaches bearer tokens to every request and recovers
//! from an expired session with a single shared refresh.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, Resource};
pub use auth::{FileTokenStore, MemoryTokenStore, Refresher, TokenPair, TokenStore};
pub use config::Config;
