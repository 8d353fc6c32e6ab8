//! `api` crate — HTTP surface for remote workers and operators.
//!
//! All routes live under `/api/v1`:
//!   GET    /workflows                  POST /workflows
//!   GET    /workflows/:id              POST /workflows/:id/insert
//!   POST   /workflows/:id/defuse       GET  /workflows/:id/stalled
//!   GET    /fireworks/:id              PATCH /fireworks/:id (priority)
//!   POST   /fireworks/:id/:command     (rerun|defuse|pause|resume|reignite|archive)
//!   POST   /claim                      (204 when no work)
//!   GET    /launches/:id
//!   POST   /launches/:id/running|ping|complete|reservation|trackers

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use engine::Engine;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod error;
pub mod handlers;

pub use error::ApiError;

use handlers::{fireworks, launches, workflows};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/workflows", get(workflows::list).post(workflows::create))
        .route("/workflows/:id", get(workflows::get))
        .route("/workflows/:id/insert", post(workflows::insert))
        .route("/workflows/:id/defuse", post(workflows::defuse))
        .route("/workflows/:id/stalled", get(workflows::stalled))
        .route("/fireworks/:id", get(fireworks::get).patch(fireworks::priority))
        .route("/fireworks/:id/:command", post(fireworks::command))
        .route("/claim", post(launches::claim))
        .route("/launches/:id", get(launches::get))
        .route("/launches/:id/running", post(launches::running))
        .route("/launches/:id/ping", post(launches::ping))
        .route("/launches/:id/reservation", post(launches::reservation))
        .route("/launches/:id/trackers", post(launches::trackers))
        .route("/launches/:id/complete", post(launches::complete));

    Router::new()
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `bind` and serve until `shutdown` resolves.
pub async fn serve(
    bind: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
