mod agent_download;
mod deployments;
pub mod error;
mod events;
mod servers;
pub mod webhooks;

pub use error::{ApiError, ErrorCode};

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/paas-deploy/v1/webhooks/github",
            post(webhooks::github_webhook),
        )
        .route(
            "/paas-deploy/v1/apps/:app_id/deployments",
            post(deployments::create_deployment),
        )
        .route(
            "/paas-deploy/v1/deployments/:id",
            get(deployments::get_deployment),
        )
        .route(
            "/paas-deploy/v1/deployments/:id/cancel",
            post(deployments::cancel_deployment),
        )
        .route(
            "/paas-deploy/v1/servers/:id/provision",
            post(servers::provision_server),
        )
        .route("/paas-deploy/v1/events", get(events::event_stream))
        .route("/agent/download", get(agent_download::download_agent))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
