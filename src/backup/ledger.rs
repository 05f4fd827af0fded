//! Run ledger: the audit trail of every backup, restore, and setup
//! attempt. Rows are created `running` and receive exactly one terminal
//! update; nothing in this subsystem ever deletes them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::postgres::PgRow;

use crate::backup::{Actor, BackupError, Result, RunAction, RunMode, RunStatus};
use crate::db::SqlxAppPool;

/// One audited attempt
#[derive(Debug, Clone, Serialize)]
pub struct BackupRun {
    pub id: i64,
    pub action: RunAction,
    pub mode: RunMode,
    pub status: RunStatus,
    pub message: String,
    pub details: serde_json::Value,
    pub actor_user_id: Option<String>,
    pub actor_email: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Append/update contract for the audit trail
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Record the start of an attempt and return its run id.
    async fn open(&self, action: RunAction, mode: RunMode, actor: Option<Actor>) -> Result<i64>;

    /// Write the single terminal update for a run.
    async fn finish(
        &self,
        run_id: i64,
        status: RunStatus,
        message: String,
        details: serde_json::Value,
    ) -> Result<()>;

    /// Most recent run for an action/mode pair.
    async fn latest(&self, action: RunAction, mode: RunMode) -> Result<Option<BackupRun>>;

    /// Whether a successful automatic run of `action` started at or after
    /// `since`. Drives the once-per-day scheduler guarantee.
    async fn automatic_success_since(
        &self,
        action: RunAction,
        since: DateTime<Local>,
    ) -> Result<bool>;
}

/// PostgreSQL-backed run ledger
pub struct PgRunLedger {
    pool: Arc<SqlxAppPool>,
}

impl PgRunLedger {
    pub fn new(pool: Arc<SqlxAppPool>) -> Self {
        Self { pool }
    }
}

fn run_from_row(row: &PgRow) -> Result<BackupRun> {
    let action: String = row.try_get("action")?;
    let mode: String = row.try_get("mode")?;
    let status: String = row.try_get("status")?;

    Ok(BackupRun {
        id: row.try_get("id")?,
        action: RunAction::parse(&action)
            .ok_or_else(|| BackupError::Validation(format!("unknown run action: {}", action)))?,
        mode: RunMode::parse(&mode)
            .ok_or_else(|| BackupError::Validation(format!("unknown run mode: {}", mode)))?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| BackupError::Validation(format!("unknown run status: {}", status)))?,
        message: row.try_get("message")?,
        details: row.try_get("details")?,
        actor_user_id: row.try_get("actor_user_id")?,
        actor_email: row.try_get("actor_email")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl RunLedger for PgRunLedger {
    async fn open(&self, action: RunAction, mode: RunMode, actor: Option<Actor>) -> Result<i64> {
        let pool = self.pool.current().await;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO backup_runs (action, mode, status, message, details, actor_user_id, actor_email)
            VALUES ($1, $2, 'running', '', '{}'::jsonb, $3, $4)
            RETURNING id
            "#,
        )
        .bind(action.as_str())
        .bind(mode.as_str())
        .bind(actor.as_ref().map(|a| a.id.clone()))
        .bind(actor.as_ref().map(|a| a.email.clone()))
        .fetch_one(&pool)
        .await?;

        Ok(id)
    }

    async fn finish(
        &self,
        run_id: i64,
        status: RunStatus,
        message: String,
        details: serde_json::Value,
    ) -> Result<()> {
        let pool = self.pool.current().await;
        sqlx::query(
            r#"
            UPDATE backup_runs
            SET status = $2, message = $3, details = $4, finished_at = now()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(message)
        .bind(details)
        .execute(&pool)
        .await?;

        Ok(())
    }

    async fn latest(&self, action: RunAction, mode: RunMode) -> Result<Option<BackupRun>> {
        let pool = self.pool.current().await;
        let row = sqlx::query(
            r#"
            SELECT id, action, mode, status, message, details,
                   actor_user_id, actor_email, started_at, finished_at
            FROM backup_runs
            WHERE action = $1 AND mode = $2
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(action.as_str())
        .bind(mode.as_str())
        .fetch_optional(&pool)
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn automatic_success_since(
        &self,
        action: RunAction,
        since: DateTime<Local>,
    ) -> Result<bool> {
        let pool = self.pool.current().await;
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM backup_runs
                WHERE action = $1 AND mode = 'automatic' AND status = 'success'
                  AND started_at >= $2
            )
            "#,
        )
        .bind(action.as_str())
        .bind(since)
        .fetch_one(&pool)
        .await?;

        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    // Needs a PostgreSQL server; point TEST_DATABASE_URL at one and run
    // with --ignored.
    #[tokio::test]
    #[ignore]
    async fn test_run_lifecycle_round_trip() {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL not set");
        let pool = Arc::new(SqlxAppPool::connect(&url).await.unwrap());
        let ledger = PgRunLedger::new(pool);

        let id = ledger
            .open(
                RunAction::Backup,
                RunMode::Automatic,
                None,
            )
            .await
            .unwrap();

        let open = ledger
            .latest(RunAction::Backup, RunMode::Automatic)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(open.id, id);
        assert_eq!(open.status, RunStatus::Running);
        assert!(open.finished_at.is_none());

        ledger
            .finish(
                id,
                RunStatus::Success,
                String::from("backup completed"),
                serde_json::json!({"prefix": "app_20250601_143000"}),
            )
            .await
            .unwrap();

        let done = ledger
            .latest(RunAction::Backup, RunMode::Automatic)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, RunStatus::Success);
        assert!(done.finished_at.is_some());

        let since = Local::now() - Duration::minutes(5);
        assert!(
            ledger
                .automatic_success_since(RunAction::Backup, since)
                .await
                .unwrap()
        );
    }
}
