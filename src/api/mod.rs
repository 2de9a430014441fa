//! HTTP API Module
//!
//! Exposes the local election snapshot over HTTP.

mod http;

pub use http::{HealthResponse, LeaderResponse, StatusServer};
