//! Backend-side liveness endpoint.

use axum::{http::StatusCode, routing::get, Router};

pub const PING_PATH: &str = "/ping";
pub const PONG: &str = "pong";

async fn ping() -> (StatusCode, &'static str) {
    (StatusCode::OK, PONG)
}

/// Router serving `GET /ping`.
pub fn router() -> Router {
    Router::new().route(PING_PATH, get(ping))
}
