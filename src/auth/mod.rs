//! Authentication for the campus API
//!
//! Holds the access/refresh token pair, decides when the access token is
//! stale, and refreshes it against `/auth/refresh`.

pub mod refresher;
pub mod session;
pub mod store;
pub mod tokens;

pub use refresher::{RefreshError, Refresher};
pub use session::{login, logout, status, SessionStatus, TokenState};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use tokens::{
    decode_claims, is_expired, is_refresh_token_expired, Claims, TokenDecodeError, TokenPair,
};
