//! Deploy submission and inspection, the surface the outer CRUD layer
//! drives.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::error::ApiError;
use crate::db::{App, Deployment};
use crate::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct CreateDeploymentRequest {
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
}

/// `POST /paas-deploy/v1/apps/:app_id/deployments`
pub async fn create_deployment(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    payload: Option<Json<CreateDeploymentRequest>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();

    let app = sqlx::query_as::<_, App>("SELECT * FROM apps WHERE id = ? AND status != 'deleted'")
        .bind(&app_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("app {} not found", app_id)))?;

    let deployment = state
        .queue
        .create(
            &app.id,
            request.commit_sha.as_deref().unwrap_or(""),
            request.commit_message.as_deref().unwrap_or(""),
        )
        .await
        .map_err(ApiError::from)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": deployment.id, "status": deployment.status })),
    ))
}

/// `GET /paas-deploy/v1/deployments/:id`
pub async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment = state
        .queue
        .get(&id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("deployment {} not found", id)))?;
    Ok(Json(deployment))
}

/// `POST /paas-deploy/v1/deployments/:id/cancel`: pending deployments only.
pub async fn cancel_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let deployment = state
        .queue
        .get(&id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("deployment {} not found", id)))?;

    if state.queue.mark_cancelled(&id).await.map_err(ApiError::from)? {
        Ok(Json(json!({ "id": id, "status": "cancelled" })))
    } else {
        Err(ApiError::conflict(format!(
            "deployment is {} and can no longer be cancelled",
            deployment.status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use crate::notifier::Notifier;
    use crate::pki::CaHolder;
    use crate::queue::{test_support::seed_app, DeployQueue};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let pool = db::init_in_memory().await.unwrap();
        seed_app(&pool, "a1", "demo").await;
        let queue = Arc::new(DeployQueue::new(pool.clone()));
        let ca = Arc::new(CaHolder::load_or_create(&pool).await.unwrap());
        Arc::new(AppState::new(
            Config::default(),
            pool,
            queue,
            Arc::new(Notifier::new()),
            ca,
        ))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_submit_then_conflict() {
        let state = test_state().await;
        let router = crate::api::create_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/paas-deploy/v1/apps/a1/deployments")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"commit_sha":"abc123def4567890"}"#))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "pending");

        // A second submission while the first is non-terminal is a 409.
        let request = Request::builder()
            .method("POST")
            .uri("/paas-deploy/v1/apps/a1/deployments")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"commit_sha":"def456"}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "deploy_in_progress");
    }

    #[tokio::test]
    async fn test_get_deployment_detail() {
        let state = test_state().await;
        let deployment = state.queue.create("a1", "abc", "msg").await.unwrap();
        let router = crate::api::create_router(state);

        let request = Request::builder()
            .uri(format!("/paas-deploy/v1/deployments/{}", deployment.id))
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["commit_sha"], "abc");

        let request = Request::builder()
            .uri("/paas-deploy/v1/deployments/missing")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_pending_only() {
        let state = test_state().await;
        let deployment = state.queue.create("a1", "abc", "m").await.unwrap();
        let router = crate::api::create_router(state.clone());

        let request = Request::builder()
            .method("POST")
            .uri(format!("/paas-deploy/v1/deployments/{}/cancel", deployment.id))
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Already terminal: a second cancel conflicts.
        let request = Request::builder()
            .method("POST")
            .uri(format!("/paas-deploy/v1/deployments/{}/cancel", deployment.id))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
