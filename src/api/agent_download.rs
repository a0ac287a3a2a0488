//! One-time-token download of the agent binary, used during provisioning.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::db::AgentDownloadToken;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub token: Option<String>,
}

/// `GET /agent/download?token=<one-time>`. The token is consumed before the
/// first byte leaves; a replay sees 401.
pub async fn download_agent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DownloadQuery>,
) -> impl IntoResponse {
    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    let record = sqlx::query_as::<_, AgentDownloadToken>(
        "SELECT * FROM agent_download_tokens WHERE token = ?",
    )
    .bind(&token)
    .fetch_optional(&state.db)
    .await;

    let record = match record {
        Ok(Some(record)) => record,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid token").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Token lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "lookup failed").into_response();
        }
    };

    // Defense in depth alongside the primary-key lookup.
    if record.token.as_bytes().ct_eq(token.as_bytes()).unwrap_u8() != 1 {
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }
    if record.consumed != 0 {
        return (StatusCode::UNAUTHORIZED, "token already used").into_response();
    }
    let expired = chrono::DateTime::parse_from_rfc3339(&record.expires_at)
        .map(|expires| expires < chrono::Utc::now())
        .unwrap_or(true);
    if expired {
        return (StatusCode::UNAUTHORIZED, "token expired").into_response();
    }

    // Consume atomically; a concurrent request loses the guarded update.
    let consumed = sqlx::query(
        "UPDATE agent_download_tokens SET consumed = 1 WHERE token = ? AND consumed = 0",
    )
    .bind(&token)
    .execute(&state.db)
    .await;
    match consumed {
        Ok(result) if result.rows_affected() == 1 => {}
        Ok(_) => return (StatusCode::UNAUTHORIZED, "token already used").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Token consume failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "consume failed").into_response();
        }
    }

    match tokio::fs::read(&record.binary_path).await {
        Ok(bytes) => {
            tracing::info!(bytes = bytes.len(), "Serving agent binary");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                bytes,
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(path = %record.binary_path, error = %e, "Agent binary unreadable");
            (StatusCode::INTERNAL_SERVER_ERROR, "binary unavailable").into_response()
        }
    }
}
