//! HTTP retrieval utilities.

pub mod api_http;

pub use api_http::ReadApiClient;
