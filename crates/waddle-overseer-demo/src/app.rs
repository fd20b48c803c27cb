// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Waddle Social

//! The supervised program: a hello server on every inherited listener.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use waddle_overseer::{GracefulShutdown, RestartHandle};

/// Build identifier baked in at compile time, `1` when unset.
pub const BUILD_ID: &str = match option_env!("OVERSEER_DEMO_BUILD_ID") {
    Some(id) => id,
    None => "1",
};

/// Shared handler state
pub struct AppState {
    pub id: String,
    pub bin_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub shutdown: GracefulShutdown,
    pub restart: RestartHandle,
}

#[derive(Debug, Deserialize)]
struct HelloParams {
    /// Delay before answering, in milliseconds.
    d: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Status {
    pub build: String,
    pub id: String,
    pub bin_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub active_requests: usize,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/status", get(status))
        .route("/restart", post(restart))
        .with_state(state)
}

async fn hello(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HelloParams>,
) -> String {
    let _guard = state.shutdown.connection_guard();
    if let Some(ms) = params.d {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
    format!("app#{BUILD_ID} ({}) says hello\n", state.id)
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Status> {
    Json(Status {
        build: BUILD_ID.to_string(),
        id: state.id.clone(),
        bin_id: state.bin_id.clone(),
        started_at: state.started_at,
        active_requests: state.shutdown.active_connections(),
    })
}

async fn restart(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.restart.trigger() {
        Ok(()) => (StatusCode::ACCEPTED, "restart requested\n"),
        Err(e) => {
            error!(error = %e, "Failed to request restart");
            (StatusCode::INTERNAL_SERVER_ERROR, "restart failed\n")
        }
    }
}

/// Serve `router` on every listener until the shutdown stop token fires.
pub async fn serve(
    router: Router,
    listeners: Vec<(String, TcpListener)>,
    shutdown: &GracefulShutdown,
) {
    let mut servers = JoinSet::new();
    for (address, listener) in listeners {
        let router = router.clone();
        let stop = shutdown.stop_token();
        servers.spawn(async move {
            let local = listener.local_addr().ok();
            info!(address = %address, local = ?local, "Serving HTTP");
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    stop.cancelled().await;
                    info!(address = %address, "HTTP server stopping, draining requests");
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "HTTP server failed");
            }
        });
    }
    while servers.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use waddle_overseer::State as OverseerState;

    async fn start() -> (std::net::SocketAddr, GracefulShutdown, tokio::task::JoinHandle<()>) {
        let disabled = OverseerState::disabled();
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        let state = Arc::new(AppState {
            id: "test".into(),
            bin_id: Some("cafe".into()),
            started_at: disabled.started_at,
            shutdown: shutdown.clone(),
            restart: disabled.restart_handle(),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                serve(create_router(state), vec![("test".into(), listener)], &shutdown).await
            })
        };
        (addr, shutdown, server)
    }

    #[tokio::test]
    async fn test_hello_and_status() {
        let (addr, shutdown, server) = start().await;

        let body = reqwest::get(format!("http://{addr}/?d=10"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, format!("app#{BUILD_ID} (test) says hello\n"));

        let status: Status = reqwest::get(format!("http://{addr}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.id, "test");
        assert_eq!(status.bin_id.as_deref(), Some("cafe"));
        assert_eq!(status.active_requests, 0);

        shutdown.trigger_stop();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_accepted_without_supervision() {
        let (addr, shutdown, server) = start().await;

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/restart"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

        shutdown.trigger_stop();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_request_finishes_after_stop() {
        let (addr, shutdown, server) = start().await;

        let slow = tokio::spawn(async move {
            reqwest::get(format!("http://{addr}/?d=300"))
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        });
        while shutdown.active_connections() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.trigger_stop();

        assert!(slow.await.unwrap().contains("says hello"));
        server.await.unwrap();
        assert!(shutdown.drain().await);
    }
}
