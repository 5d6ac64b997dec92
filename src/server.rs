//! HTTP surface for the monitor.
//!
//! This module provides an HTTP server that:
//! - Accepts status documents via POST /status and pushes them to every
//!   subscribed reconciliation loop
//! - Accepts session changes from the identity service via PUT /session
//! - Serves the merged dashboard view via GET /view, behind the access gate
//!
//! # Architecture
//!
//! ```text
//! status writer ──→ POST /status ──→ BroadcastStatusFeed ──┐
//! identity svc  ──→ PUT /session ──→ SessionProvider       ├─→ Reconciler ──→ GET /view
//!                                          inference backend ─┘
//! ```

use crate::aggregate::AggregateUpdater;
use crate::gate::{
    follow_sessions, Identity, MountId, MountOutcome, Route, SessionProvider, ViewMounts,
};
use crate::inference::InferenceSource;
use crate::reconcile::{
    DashboardView, ReconcilerConfig, ReconcilerDeps, ReconcilerHub, ViewObserver,
};
use crate::stats::{SharedStats, StatsSnapshot};
use crate::status::{BroadcastStatusFeed, ChangeSet, StatusDocument};
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
    /// Loop settings for the monitored subject
    pub reconciler: ReconcilerConfig,
}

impl ServerConfig {
    pub fn new(port: u16, reconciler: ReconcilerConfig) -> Self {
        Self { port, reconciler }
    }
}

/// Collaborators the server wires together.
#[derive(Clone)]
pub struct ServerServices {
    pub source: Arc<dyn InferenceSource>,
    pub updater: AggregateUpdater,
    pub feed: BroadcastStatusFeed,
    pub sessions: SessionProvider,
    pub stats: SharedStats,
}

/// Shared server state
pub struct ServerState {
    feed: BroadcastStatusFeed,
    sessions: SessionProvider,
    stats: SharedStats,
    hub: Arc<ReconcilerHub>,
    mounts: Arc<Mutex<ViewMounts>>,
    /// The dashboard this server keeps mounted while someone is signed in
    dashboard: Mutex<Option<(MountId, ViewObserver)>>,
}

impl ServerState {
    pub fn new(config: &ServerConfig, services: ServerServices) -> Self {
        let deps = ReconcilerDeps {
            source: services.source,
            updater: services.updater,
            feed: Arc::new(services.feed.clone()),
            stats: services.stats.clone(),
        };
        let hub = Arc::new(ReconcilerHub::new(config.reconciler.clone(), deps));
        let mounts = ViewMounts::new(hub.clone(), config.reconciler.subject_id.clone());

        Self {
            feed: services.feed,
            sessions: services.sessions,
            stats: services.stats,
            hub,
            mounts: Arc::new(Mutex::new(mounts)),
            dashboard: Mutex::new(None),
        }
    }

    /// The current view, mounting the dashboard on first use.
    async fn dashboard_view(&self) -> Result<DashboardView, ApiError> {
        let mut dashboard = self.dashboard.lock().await;
        let mut mounts = self.mounts.lock().await;

        if let Some((id, observer)) = dashboard.as_ref() {
            if mounts.is_mounted(*id) {
                return Ok(observer.current());
            }
        }

        match mounts.mount("/").await.map_err(ApiError::internal)? {
            MountOutcome::Mounted {
                id,
                observer: Some(observer),
                ..
            } => {
                let view = observer.current();
                *dashboard = Some((id, observer));
                Ok(view)
            }
            MountOutcome::Mounted { id, .. } => {
                mounts.unmount(id).await;
                Err(ApiError::internal("dashboard mounted without a loop"))
            }
            MountOutcome::Redirect(_) | MountOutcome::Loading => Err(ApiError::pending()),
        }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Acknowledgement for writes
#[derive(Serialize)]
pub struct AckResponse {
    pub status: String,
    pub message: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn internal(e: impl std::fmt::Display) -> Self {
        tracing::error!("Request failed: {}", e);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorResponse {
                error: e.to_string(),
                code: "INTERNAL".to_string(),
            },
        }
    }

    fn pending() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ErrorResponse {
                error: "Session is still resolving".to_string(),
                code: "SESSION_PENDING".to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn ack(message: &str) -> Json<AckResponse> {
    Json(AckResponse {
        status: "ok".to_string(),
        message: message.to_string(),
    })
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /status
async fn current_status(State(state): State<Arc<ServerState>>) -> Json<ChangeSet> {
    Json(state.feed.current())
}

/// POST /status
///
/// Replaces the status document and pushes it to every subscriber.
async fn put_status(
    State(state): State<Arc<ServerState>>,
    Json(document): Json<StatusDocument>,
) -> Json<AckResponse> {
    state.feed.set_document(document);
    ack("Status updated")
}

/// DELETE /status
async fn clear_status(State(state): State<Arc<ServerState>>) -> Json<AckResponse> {
    state.feed.clear();
    ack("Status cleared")
}

/// PUT /session
///
/// Body is the signed-in identity, or `null` after a sign-out.
async fn put_session(
    State(state): State<Arc<ServerState>>,
    Json(identity): Json<Option<Identity>>,
) -> Json<AckResponse> {
    state.sessions.publish(identity);
    // Apply now so the next request sees it; the follower's copy is a no-op.
    state
        .mounts
        .lock()
        .await
        .on_session(state.sessions.current())
        .await;
    ack("Session updated")
}

/// GET /view
///
/// Guests are redirected to the authentication entry point.
async fn view(State(state): State<Arc<ServerState>>) -> Response {
    let route = state.mounts.lock().await.resolve("/");
    match route {
        Route::Redirect(to) => Redirect::to(to).into_response(),
        Route::Loading => ApiError::pending().into_response(),
        Route::Render(view) if !view.mounts_reconciler() => {
            Redirect::to(crate::gate::AUTH_ENTRY).into_response()
        }
        Route::Render(_) => match state.dashboard_view().await {
            Ok(view) => Json(view).into_response(),
            Err(e) => e.into_response(),
        },
    }
}

/// GET /stats
async fn stats(State(state): State<Arc<ServerState>>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    services: ServerServices,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let state = Arc::new(ServerState::new(&config, services));

    let app = Router::new()
        .route("/health", get(health))
        .route(
            "/status",
            get(current_status).post(put_status).delete(clear_status),
        )
        .route("/session", axum::routing::put(put_session))
        .route("/view", get(view))
        .route("/stats", get(stats))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://localhost:3000"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Monitor server listening on http://{}", actual_addr);

    let cancel = CancellationToken::new();
    tokio::spawn(follow_sessions(
        state.mounts.clone(),
        state.sessions.subscribe(),
        cancel.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }

        cancel.cancel();
        state.hub.shutdown().await;
    });

    Ok((actual_addr, shutdown_tx))
}
