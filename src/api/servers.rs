//! Server provisioning trigger. The CRUD surface for servers lives in the
//! outer layer; the core only exposes the first-boot workflow.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use super::error::ApiError;
use crate::db::Server;
use crate::AppState;

/// `POST /paas-deploy/v1/servers/:id/provision`: kick off first-boot
/// provisioning in the background and return immediately.
pub async fn provision_server(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let server = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = ?")
        .bind(&server_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("server {} not found", server_id)))?;

    if server.status == "provisioning" {
        return Err(ApiError::conflict("server is already being provisioned"));
    }

    let provisioner = state.provisioner.clone();
    let agents = state.agents.clone();
    tokio::spawn(async move {
        // The provisioner records the outcome on the server row.
        let _ = provisioner.provision(&server_id, &agents).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": server.id, "status": "provisioning" })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use crate::notifier::Notifier;
    use crate::pki::CaHolder;
    use crate::queue::DeployQueue;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_provision_unknown_server_is_404() {
        let pool = db::init_in_memory().await.unwrap();
        let queue = Arc::new(DeployQueue::new(pool.clone()));
        let ca = Arc::new(CaHolder::load_or_create(&pool).await.unwrap());
        let state = Arc::new(AppState::new(
            Config::default(),
            pool,
            queue,
            Arc::new(Notifier::new()),
            ca,
        ));
        let router = crate::api::create_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/paas-deploy/v1/servers/nope/provision")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
