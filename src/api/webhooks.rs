//! GitHub webhook intake: signed push events become pending deployments.
//!
//! Only a bad signature earns a 401 and only malformed JSON a 400. Every
//! "nothing to do" outcome is a 200 with an explanatory message so GitHub's
//! redelivery machinery never retries what cannot succeed; an accepted push
//! is a 202.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;

use crate::error::Error;
use crate::utils::{new_id, now_rfc3339};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

const COMMIT_MESSAGE_LIMIT: usize = 200;

/// Compute the `X-Hub-Signature-256` value for a payload.
pub fn generate_signature(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of the signature header.
pub fn verify_signature(secret: &str, signature_header: &str, payload: &[u8]) -> bool {
    let signature = match signature_header.strip_prefix("sha256=") {
        Some(sig) => sig,
        None => return false,
    };
    let expected = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Deserialize)]
pub struct GitHubPushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub deleted: bool,
    pub repository: GitHubRepository,
    pub head_commit: Option<GitHubCommit>,
}

#[derive(Debug, Deserialize)]
pub struct GitHubRepository {
    pub clone_url: String,
    #[serde(default)]
    pub ssh_url: String,
    #[serde(default)]
    pub html_url: String,
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct GitHubCommit {
    pub id: String,
    #[serde(default)]
    pub message: String,
}

/// First line of the commit message, truncated for the deployment record.
pub fn summarize_commit_message(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("");
    first_line.chars().take(COMMIT_MESSAGE_LIMIT).collect()
}

/// URL variants under which an app may have registered this repository.
pub fn repository_url_variants(repo: &GitHubRepository) -> Vec<String> {
    let mut variants = vec![repo.clone_url.clone()];
    if let Some(stripped) = repo.clone_url.strip_suffix(".git") {
        variants.push(stripped.to_string());
    }
    if !repo.ssh_url.is_empty() {
        variants.push(repo.ssh_url.clone());
    }
    if !repo.html_url.is_empty() {
        variants.push(repo.html_url.clone());
    }
    variants
}

fn message_response(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "message": message })))
}

pub async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("push")
        .to_string();
    let delivery_id = headers
        .get("X-GitHub-Delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    // Signature first; nothing else is looked at on a bad one.
    if let Some(ref secret) = state.config.webhooks.github_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, signature, &body) {
            tracing::warn!(delivery_id = %delivery_id, "Webhook signature verification failed");
            return message_response(StatusCode::UNAUTHORIZED, "invalid signature");
        }
    }

    audit_payload(&state, &delivery_id, &event_type, &body).await;

    match event_type.as_str() {
        "ping" => message_response(StatusCode::OK, "pong"),
        "push" => handle_push(&state, &body).await,
        other => {
            tracing::debug!(event = %other, "Ignoring webhook event type");
            message_response(StatusCode::OK, "event ignored")
        }
    }
}

async fn handle_push(state: &Arc<AppState>, body: &[u8]) -> (StatusCode, Json<Value>) {
    let payload: GitHubPushEvent = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed push payload");
            return message_response(StatusCode::BAD_REQUEST, "malformed payload");
        }
    };

    if payload.deleted {
        return message_response(StatusCode::OK, "branch deletion ignored");
    }
    let branch = match payload.git_ref.strip_prefix("refs/heads/") {
        Some(branch) => branch,
        None => return message_response(StatusCode::OK, "non-branch ref ignored"),
    };

    tracing::info!(
        repository = %payload.repository.full_name,
        branch = %branch,
        "Push event received"
    );

    let variants = repository_url_variants(&payload.repository);
    let placeholders = vec!["?"; variants.len()].join(", ");
    let sql = format!(
        "SELECT id, branch FROM apps WHERE status != 'deleted' AND repository_url IN ({})",
        placeholders
    );
    let mut query = sqlx::query_as::<_, (String, String)>(&sql);
    for variant in &variants {
        query = query.bind(variant);
    }
    let apps = match query.fetch_all(&state.db).await {
        Ok(apps) => apps,
        Err(e) => {
            tracing::error!(error = %e, "App lookup failed");
            return message_response(StatusCode::OK, "lookup failed, not queued");
        }
    };

    let Some((app_id, _)) = apps.iter().find(|(_, b)| b.as_str() == branch) else {
        if apps.is_empty() {
            return message_response(StatusCode::OK, "repository not tracked");
        }
        return message_response(StatusCode::OK, "branch not tracked");
    };

    let (sha, message) = match &payload.head_commit {
        Some(commit) => (commit.id.clone(), summarize_commit_message(&commit.message)),
        None => (String::new(), String::new()),
    };

    match state.queue.create(app_id, &sha, &message).await {
        Ok(deployment) => {
            tracing::info!(deployment_id = %deployment.id, app_id = %app_id, "Deployment queued from push");
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "message": "deployment queued",
                    "deployment_id": deployment.id,
                })),
            )
        }
        Err(Error::DeployInProgress) => {
            message_response(StatusCode::OK, "deployment already in progress")
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to queue deployment");
            message_response(StatusCode::OK, "could not queue deployment")
        }
    }
}

async fn audit_payload(state: &Arc<AppState>, delivery_id: &str, event_type: &str, body: &[u8]) {
    let result = sqlx::query(
        "INSERT INTO webhook_payloads (id, delivery_id, event_type, payload, received_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(new_id())
    .bind(delivery_id)
    .bind(event_type)
    .bind(body)
    .bind(now_rfc3339())
    .execute(&state.db)
    .await;

    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to audit webhook payload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_roundtrip() {
        let payload = br#"{"ref":"refs/heads/main"}"#;
        let signature = generate_signature("s3cret", payload);
        assert!(verify_signature("s3cret", &signature, payload));
    }

    #[test]
    fn test_signature_flips_on_payload_change() {
        let payload = b"payload-bytes".to_vec();
        let signature = generate_signature("s3cret", &payload);

        let mut tampered = payload.clone();
        tampered[0] ^= 1;
        assert!(!verify_signature("s3cret", &signature, &tampered));
        assert!(!verify_signature("wrong-secret", &signature, &payload));
    }

    #[test]
    fn test_signature_rejects_malformed_header() {
        assert!(!verify_signature("s", "md5=abcd", b"x"));
        assert!(!verify_signature("s", "sha256=zznothex", b"x"));
        assert!(!verify_signature("s", "", b"x"));
    }

    #[test]
    fn test_commit_message_first_line_truncated() {
        let message = format!("{}\nsecond line", "x".repeat(300));
        let summary = summarize_commit_message(&message);
        assert_eq!(summary.len(), COMMIT_MESSAGE_LIMIT);
        assert!(!summary.contains('\n'));
        assert_eq!(summarize_commit_message("fix: bug"), "fix: bug");
    }

    mod intake {
        use super::*;
        use crate::config::Config;
        use crate::db;
        use crate::notifier::Notifier;
        use crate::pki::CaHolder;
        use crate::queue::{test_support::seed_app, DeployQueue};
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        const SECRET: &str = "hook-secret";

        async fn test_state() -> Arc<AppState> {
            let pool = db::init_in_memory().await.unwrap();
            seed_app(&pool, "a1", "demo").await;
            let queue = Arc::new(DeployQueue::new(pool.clone()));
            let ca = Arc::new(CaHolder::load_or_create(&pool).await.unwrap());
            let mut config = Config::default();
            config.webhooks.github_secret = Some(SECRET.to_string());
            Arc::new(AppState::new(
                config,
                pool,
                queue,
                Arc::new(Notifier::new()),
                ca,
            ))
        }

        fn push_body(git_ref: &str) -> Vec<u8> {
            json!({
                "ref": git_ref,
                "deleted": false,
                "repository": {
                    "clone_url": "https://github.com/o/demo.git",
                    "ssh_url": "git@github.com:o/demo.git",
                    "html_url": "https://github.com/o/demo",
                    "full_name": "o/demo",
                },
                "head_commit": {
                    "id": "abc123def4567890",
                    "message": "fix: handle empty payloads\n\nlonger body",
                },
            })
            .to_string()
            .into_bytes()
        }

        fn signed_request(event: &str, body: Vec<u8>, signature: &str) -> Request<Body> {
            Request::builder()
                .method("POST")
                .uri("/paas-deploy/v1/webhooks/github")
                .header("X-GitHub-Event", event)
                .header("X-GitHub-Delivery", "delivery-1")
                .header("X-Hub-Signature-256", signature)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap()
        }

        #[tokio::test]
        async fn test_push_queues_deployment() {
            let state = test_state().await;
            let router = crate::api::create_router(state.clone());

            let body = push_body("refs/heads/main");
            let signature = generate_signature(SECRET, &body);
            let response = router
                .oneshot(signed_request("push", body, &signature))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);

            let (deployment, _) = state.queue.get_next_pending().await.unwrap().unwrap();
            assert_eq!(deployment.commit_sha, "abc123def4567890");
            assert_eq!(deployment.commit_message, "fix: handle empty payloads");
        }

        #[tokio::test]
        async fn test_untracked_branch_is_200_without_row() {
            let state = test_state().await;
            let router = crate::api::create_router(state.clone());

            let body = push_body("refs/heads/develop");
            let signature = generate_signature(SECRET, &body);
            let response = router
                .oneshot(signed_request("push", body, &signature))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
                .await
                .unwrap();
            let value: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(value["message"], "branch not tracked");
            assert!(state.queue.get_next_pending().await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_bad_signature_is_401() {
            let state = test_state().await;
            let router = crate::api::create_router(state.clone());

            let body = push_body("refs/heads/main");
            let response = router
                .oneshot(signed_request("push", body, "sha256=deadbeef"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert!(state.queue.get_next_pending().await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_malformed_json_is_400() {
            let state = test_state().await;
            let router = crate::api::create_router(state);

            let body = b"{not json".to_vec();
            let signature = generate_signature(SECRET, &body);
            let response = router
                .oneshot(signed_request("push", body, &signature))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn test_ping_pongs() {
            let state = test_state().await;
            let router = crate::api::create_router(state);

            let body = b"{\"zen\":\"Keep it logically awesome.\"}".to_vec();
            let signature = generate_signature(SECRET, &body);
            let response = router
                .oneshot(signed_request("ping", body, &signature))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        #[tokio::test]
        async fn test_second_push_while_pending_is_200() {
            let state = test_state().await;
            let router = crate::api::create_router(state.clone());

            for expected in [StatusCode::ACCEPTED, StatusCode::OK] {
                let body = push_body("refs/heads/main");
                let signature = generate_signature(SECRET, &body);
                let response = router
                    .clone()
                    .oneshot(signed_request("push", body, &signature))
                    .await
                    .unwrap();
                assert_eq!(response.status(), expected);
            }
        }
    }

    #[test]
    fn test_repository_url_variants() {
        let repo = GitHubRepository {
            clone_url: "https://github.com/o/demo.git".into(),
            ssh_url: "git@github.com:o/demo.git".into(),
            html_url: "https://github.com/o/demo".into(),
            full_name: "o/demo".into(),
        };
        let variants = repository_url_variants(&repo);
        assert!(variants.contains(&"https://github.com/o/demo.git".to_string()));
        assert!(variants.contains(&"https://github.com/o/demo".to_string()));
        assert!(variants.contains(&"git@github.com:o/demo.git".to_string()));
    }
}
