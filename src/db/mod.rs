mod models;

pub use models::*;

use anyhow::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

pub type DbPool = SqlitePool;

/// Execute a SQL migration file, properly handling comments
async fn execute_sql(pool: &SqlitePool, sql: &str) -> Result<()> {
    let uncommented: String = sql
        .lines()
        .filter(|line| !line.trim().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    for statement in uncommented.split(';') {
        let trimmed = statement.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }
    Ok(())
}

pub async fn init(data_dir: &Path) -> Result<DbPool> {
    let db_path = data_dir.join("paasdeploy.db");
    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    info!("Initializing database at {}", db_path.display());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    configure(&pool).await?;
    run_migrations(&pool).await?;

    info!("Database initialized successfully");
    Ok(pool)
}

/// In-memory pool for tests.
pub async fn init_in_memory() -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    configure(&pool).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn configure(pool: &SqlitePool) -> Result<()> {
    // WAL for concurrent readers alongside the writer.
    sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;
    sqlx::query("PRAGMA synchronous = NORMAL").execute(pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;
    Ok(())
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations...");

    // Migration 001: Initial schema
    execute_sql(pool, include_str!("../../migrations/001_initial.sql")).await?;

    // Migration 002: Webhook payload audit trail
    let has_webhook_payloads: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='webhook_payloads'",
    )
    .fetch_optional(pool)
    .await?;
    if has_webhook_payloads.is_none() {
        execute_sql(pool, include_str!("../../migrations/002_webhook_payloads.sql")).await?;
    }

    // Migration 003: One-time agent download tokens
    let has_tokens: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='agent_download_tokens'",
    )
    .fetch_optional(pool)
    .await?;
    if has_tokens.is_none() {
        execute_sql(
            pool,
            include_str!("../../migrations/003_agent_download_tokens.sql"),
        )
        .await?;
    }

    Ok(())
}
