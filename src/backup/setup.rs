//! Setup orchestrator: provisions or rotates the dedicated backup role
//! using administrator credentials, verifies the new credentials actually
//! work end-to-end, and only then persists them.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::backup::lock::OperationLock;
use crate::backup::settings::{BackupSettings, SettingsStore, clamp_schedule};
use crate::backup::{Actor, BackupError, Result, RunAction, RunMode, RunStatus};
use crate::backup::ledger::RunLedger;
use crate::db::connect_single;

/// Administrator credentials plus the desired backup-role credentials and
/// schedule.
#[derive(Clone, Deserialize)]
pub struct SetupRequest {
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub admin_user: String,
    pub admin_password: String,
    pub backup_user: String,
    pub backup_password: String,
    pub schedule_hour: u8,
    pub schedule_minute: u8,
    pub enabled: bool,
}

pub struct SetupOrchestrator {
    settings: Arc<dyn SettingsStore>,
    ledger: Arc<dyn RunLedger>,
    lock: OperationLock,
}

impl SetupOrchestrator {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        ledger: Arc<dyn RunLedger>,
        lock: OperationLock,
    ) -> Self {
        Self {
            settings,
            ledger,
            lock,
        }
    }

    pub async fn provision(&self, request: SetupRequest, actor: Option<Actor>) -> Result<()> {
        let guard = self.lock.try_acquire("setup")?;
        let updated_by = actor.as_ref().map(|a| a.email.clone());
        let run_id = self
            .ledger
            .open(RunAction::Setup, RunMode::Manual, actor)
            .await?;

        match self.perform(&request, updated_by).await {
            Ok(()) => {
                info!(backup_user = %request.backup_user, "backup role provisioned and verified");
                self.ledger
                    .finish(
                        run_id,
                        RunStatus::Success,
                        format!("backup role {} provisioned and verified", request.backup_user),
                        json!({
                            "host": request.host,
                            "database": request.database_name,
                            "backup_user": request.backup_user,
                        }),
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "backup role setup failed");
                guard.record_error(&e.to_string());
                self.ledger
                    .finish(run_id, RunStatus::Error, e.to_string(), json!({}))
                    .await?;
                Err(e)
            }
        }
    }

    async fn perform(&self, request: &SetupRequest, updated_by: Option<String>) -> Result<()> {
        if request.backup_user.is_empty() || request.backup_password.is_empty() {
            return Err(BackupError::Validation(String::from(
                "backup role name and password are required",
            )));
        }

        // Administrator session against the maintenance database.
        let admin = connect_single(
            &request.host,
            request.port,
            "postgres",
            &request.admin_user,
            &request.admin_password,
        )
        .await
        .map_err(|e| BackupError::Validation(format!("administrator connection failed: {}", e)))?;

        let db_exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
                .bind(&request.database_name)
                .fetch_optional(&admin)
                .await?;
        if db_exists.is_none() {
            admin.close().await;
            return Err(BackupError::Validation(format!(
                "database {} does not exist on {}",
                request.database_name, request.host
            )));
        }

        let role_exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM pg_roles WHERE rolname = $1")
                .bind(&request.backup_user)
                .fetch_optional(&admin)
                .await?;

        // Role DDL takes no bind parameters; identifiers and the password
        // literal are quoted by hand.
        let role_sql = if role_exists.is_some() {
            format!(
                "ALTER ROLE {} WITH LOGIN SUPERUSER PASSWORD {}",
                quote_ident(&request.backup_user),
                quote_literal(&request.backup_password),
            )
        } else {
            format!(
                "CREATE ROLE {} LOGIN SUPERUSER PASSWORD {}",
                quote_ident(&request.backup_user),
                quote_literal(&request.backup_password),
            )
        };
        sqlx::query(&role_sql).execute(&admin).await?;

        sqlx::query(&format!(
            "GRANT CONNECT ON DATABASE {} TO {}",
            quote_ident(&request.database_name),
            quote_ident(&request.backup_user),
        ))
        .execute(&admin)
        .await?;

        admin.close().await;

        // Reconnect as the new role before persisting anything: the dump
        // tooling needs elevated catalog access, not just a login.
        let probe = connect_single(
            &request.host,
            request.port,
            &request.database_name,
            &request.backup_user,
            &request.backup_password,
        )
        .await
        .map_err(|e| {
            BackupError::Validation(format!("backup role verification failed: {}", e))
        })?;

        let _roles: i64 = sqlx::query_scalar("SELECT count(*) FROM pg_authid")
            .fetch_one(&probe)
            .await
            .map_err(|e| {
                BackupError::Validation(format!("privileged catalog read failed: {}", e))
            })?;
        probe.close().await;

        let current = self.settings.read().await?;
        let (schedule_hour, schedule_minute) =
            clamp_schedule(request.schedule_hour as i64, request.schedule_minute as i64);

        self.settings
            .write(
                BackupSettings {
                    enabled: request.enabled,
                    host: request.host.clone(),
                    port: request.port,
                    database_name: request.database_name.clone(),
                    backup_user: request.backup_user.clone(),
                    password: request.backup_password.clone(),
                    schedule_hour,
                    schedule_minute,
                    ..current
                },
                updated_by,
            )
            .await
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}
