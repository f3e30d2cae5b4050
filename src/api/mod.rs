//! API client module for the campus backend

pub mod client;
pub mod error;
pub mod resources;

pub use client::{ApiClient, ApiClientBuilder, ApiRequest};
pub use error::ApiError;
pub use resources::{Resource, Resources};
