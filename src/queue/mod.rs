//! Durable deploy queue over the `deployments` table.
//!
//! Single-writer control plane: dequeue safety comes from guarded UPDATEs
//! (a claim only succeeds from the expected prior status) plus the
//! no-running-sibling predicate, which together give the skip-locked
//! behavior the scheduler needs on SQLite.

use tracing::info;

use crate::db::{App, Deployment, DbPool};
use crate::error::{Error, Result};
use crate::utils::{new_id, now_rfc3339};

pub struct DeployQueue {
    db: DbPool,
}

impl DeployQueue {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    /// Create a pending deployment. Fails with `DeployInProgress` when the
    /// app already has a pending or running one.
    pub async fn create(
        &self,
        app_id: &str,
        commit_sha: &str,
        commit_message: &str,
    ) -> Result<Deployment> {
        let (in_flight,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM deployments WHERE app_id = ? AND status IN ('pending', 'running')",
        )
        .bind(app_id)
        .fetch_one(&self.db)
        .await?;

        if in_flight > 0 {
            return Err(Error::DeployInProgress);
        }

        let id = new_id();
        let now = now_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO deployments (id, app_id, commit_sha, commit_message, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(app_id)
        .bind(commit_sha)
        .bind(commit_message)
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("deployment {}", id)))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as::<_, Deployment>("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(deployment)
    }

    /// Oldest pending deployment whose app has no running sibling, joined
    /// with its (non-deleted) app row.
    pub async fn get_next_pending(&self) -> Result<Option<(Deployment, App)>> {
        let deployment = sqlx::query_as::<_, Deployment>(
            r#"
            SELECT d.* FROM deployments d
            JOIN apps a ON a.id = d.app_id AND a.status != 'deleted'
            WHERE d.status = 'pending'
              AND NOT EXISTS (
                SELECT 1 FROM deployments r
                WHERE r.app_id = d.app_id AND r.status = 'running'
              )
            ORDER BY d.created_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.db)
        .await?;

        let Some(deployment) = deployment else {
            return Ok(None);
        };

        let app = sqlx::query_as::<_, App>("SELECT * FROM apps WHERE id = ?")
            .bind(&deployment.app_id)
            .fetch_one(&self.db)
            .await?;

        Ok(Some((deployment, app)))
    }

    /// Claim a pending deployment. Returns false when another worker (or a
    /// cancellation) got there first.
    pub async fn mark_running(&self, id: &str) -> Result<bool> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE deployments SET status = 'running', started_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_success(&self, id: &str, image_tag: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE deployments SET status = 'success', current_image_tag = ?, finished_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(image_tag)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, message: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE deployments SET status = 'failed', error_message = ?, finished_at = ?, updated_at = ? \
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(message)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Cancel a deployment that has not started. Running deployments finish
    /// or fail; they are not preempted.
    pub async fn mark_cancelled(&self, id: &str) -> Result<bool> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE deployments SET status = 'cancelled', finished_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Append a chunk to the deployment's log. Logs only grow.
    pub async fn append_logs(&self, id: &str, chunk: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET logs = logs || ?, updated_at = ? WHERE id = ?")
            .bind(chunk)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn set_previous_image_tag(&self, id: &str, tag: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET previous_image_tag = ?, updated_at = ? WHERE id = ?")
            .bind(tag)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn update_app_last_deployed_at(&self, app_id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query("UPDATE apps SET last_deployed_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(app_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Crash recovery: any deployment still marked running belongs to a
    /// previous process and is rewritten to failed before new work starts.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE deployments SET status = 'failed', error_message = ?, finished_at = ?, updated_at = ? \
             WHERE status = 'running'",
        )
        .bind("interrupted by server restart")
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(count = recovered, "Recovered interrupted deployments");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub async fn seed_app(db: &DbPool, id: &str, name: &str) -> App {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO apps (id, user_id, name, repository_url, branch, created_at, updated_at) \
             VALUES (?, 'u1', ?, 'https://github.com/o/demo', 'main', ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await
        .unwrap();

        sqlx::query_as::<_, App>("SELECT * FROM apps WHERE id = ?")
            .bind(id)
            .fetch_one(db)
            .await
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::seed_app;
    use super::*;
    use crate::db;

    async fn queue() -> DeployQueue {
        DeployQueue::new(db::init_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_create_rejects_inflight_sibling() {
        let q = queue().await;
        seed_app(q.db(), "a1", "demo").await;

        q.create("a1", "abc123", "first").await.unwrap();
        let err = q.create("a1", "def456", "second").await.unwrap_err();
        assert!(matches!(err, Error::DeployInProgress));
    }

    #[tokio::test]
    async fn test_create_allowed_after_terminal() {
        let q = queue().await;
        seed_app(q.db(), "a1", "demo").await;

        let d = q.create("a1", "abc123", "first").await.unwrap();
        assert!(q.mark_running(&d.id).await.unwrap());
        q.mark_success(&d.id, "paasdeploy/demo:abc").await.unwrap();

        q.create("a1", "def456", "second").await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let q = queue().await;
        seed_app(q.db(), "a1", "demo").await;

        let d = q.create("a1", "abc123", "m").await.unwrap();
        assert!(q.mark_running(&d.id).await.unwrap());
        // Second claim of the same row must lose.
        assert!(!q.mark_running(&d.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_states_are_monotonic() {
        let q = queue().await;
        seed_app(q.db(), "a1", "demo").await;

        let d = q.create("a1", "abc123", "m").await.unwrap();
        q.mark_running(&d.id).await.unwrap();
        q.mark_success(&d.id, "tag").await.unwrap();

        // A late failure report must not move a terminal deployment.
        q.mark_failed(&d.id, "too late").await.unwrap();
        let d = q.get(&d.id).await.unwrap().unwrap();
        assert_eq!(d.status, "success");
        assert!(d.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_next_pending_skips_busy_app() {
        let q = queue().await;
        seed_app(q.db(), "a1", "demo").await;
        seed_app(q.db(), "a2", "other").await;

        let d1 = q.create("a1", "sha1", "m").await.unwrap();
        q.mark_running(&d1.id).await.unwrap();
        // Bypass create's guard to simulate a pending row behind a running one.
        sqlx::query(
            "INSERT INTO deployments (id, app_id, commit_sha, status, logs, created_at, updated_at) \
             VALUES ('d-blocked', 'a1', 'sha2', 'pending', '', '2000-01-01T00:00:00Z', '')",
        )
        .execute(q.db())
        .await
        .unwrap();
        let d3 = q.create("a2", "sha3", "m").await.unwrap();

        // Despite being newer, a2's deployment is the only eligible one.
        let (next, app) = q.get_next_pending().await.unwrap().unwrap();
        assert_eq!(next.id, d3.id);
        assert_eq!(app.id, "a2");
    }

    #[tokio::test]
    async fn test_logs_append_only() {
        let q = queue().await;
        seed_app(q.db(), "a1", "demo").await;

        let d = q.create("a1", "sha", "m").await.unwrap();
        q.append_logs(&d.id, "one\n").await.unwrap();
        let first = q.get(&d.id).await.unwrap().unwrap().logs;
        q.append_logs(&d.id, "two\n").await.unwrap();
        let second = q.get(&d.id).await.unwrap().unwrap().logs;

        assert!(second.len() >= first.len());
        assert!(second.starts_with(&first));
        assert_eq!(second, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let q = queue().await;
        seed_app(q.db(), "a1", "demo").await;

        let d = q.create("a1", "sha", "m").await.unwrap();
        q.mark_running(&d.id).await.unwrap();

        let recovered = q.recover_interrupted().await.unwrap();
        assert_eq!(recovered, 1);

        let d = q.get(&d.id).await.unwrap().unwrap();
        assert_eq!(d.status, "failed");
        assert_eq!(
            d.error_message.as_deref(),
            Some("interrupted by server restart")
        );
    }

    #[tokio::test]
    async fn test_cancel_only_from_pending() {
        let q = queue().await;
        seed_app(q.db(), "a1", "demo").await;

        let d = q.create("a1", "sha", "m").await.unwrap();
        q.mark_running(&d.id).await.unwrap();
        assert!(!q.mark_cancelled(&d.id).await.unwrap());

        let d2 = q.create("a2-missing", "sha", "m").await;
        // Creating against a missing app violates the FK.
        assert!(d2.is_err());
    }
}
