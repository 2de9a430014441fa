//! HTTP Status Server
//!
//! Read-only view of the local election snapshot.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::election::{ElectionState, StatusHandle};
use crate::error::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Snapshot published by the elector
    pub status: StatusHandle,
}

/// HTTP status server
pub struct StatusServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl StatusServer {
    /// Create a new status server
    pub fn new(config: ApiConfig, status: StatusHandle) -> Self {
        Self {
            config,
            state: Arc::new(AppState { status }),
        }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/", get(handle_leader))
            .route("/leading", get(handle_leading))
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `cancel` fires
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

/// Current leader as seen by this participant
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub name: String,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub identity: String,
    pub is_leader: bool,
}

async fn handle_leader(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(LeaderResponse {
        name: state.status.leader(),
    })
}

/// 200 while leading, 423 otherwise
async fn handle_leading(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.status.is_leader() {
        StatusCode::OK
    } else {
        StatusCode::LOCKED
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<ElectionState> {
    Json(state.status.snapshot())
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.status.snapshot();
    Json(HealthResponse {
        healthy: true,
        identity: snapshot.identity,
        is_leader: snapshot.is_leader,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::ElectionPhase;
    use crate::lock::LockKey;
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn server(leading: bool) -> (StatusServer, watch::Sender<ElectionState>) {
        let mut state = ElectionState::new("p1", &LockKey::new("default", "web"));
        if leading {
            state.phase = ElectionPhase::Leading;
            state.is_leader = true;
            state.observed_leader = "p1".to_string();
        } else {
            state.observed_leader = "p2".to_string();
        }
        let (tx, rx) = watch::channel(state);
        let config = ApiConfig {
            enabled: true,
            ..ApiConfig::default()
        };
        (StatusServer::new(config, StatusHandle::new(rx)), tx)
    }

    async fn get(server: &StatusServer, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = server
            .router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_leader_name() {
        let (server, _tx) = server(false);
        let (status, body) = get(&server, "/").await;
        assert_eq!(status, StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, serde_json::json!({ "name": "p2" }));
    }

    #[tokio::test]
    async fn test_leading_status_codes() {
        let (server, tx) = server(false);
        let (status, body) = get(&server, "/leading").await;
        assert_eq!(status, StatusCode::LOCKED);
        assert!(body.is_empty());

        tx.send_modify(|state| {
            state.is_leader = true;
            state.phase = ElectionPhase::Leading;
        });
        let (status, _) = get(&server, "/leading").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (server, _tx) = server(true);
        let (status, body) = get(&server, "/status").await;
        assert_eq!(status, StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["identity"], "p1");
        assert_eq!(body["election"], "web");
        assert_eq!(body["phase"], "Leading");
        assert_eq!(body["is_leader"], true);
    }

    #[tokio::test]
    async fn test_health() {
        let (server, _tx) = server(true);
        let (status, body) = get(&server, "/health").await;
        assert_eq!(status, StatusCode::OK);

        let body: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert!(body.healthy);
        assert!(body.is_leader);
        assert_eq!(body.identity, "p1");
    }
}
