//! Backup and restore orchestration.
//!
//! Both destructive operations run under the global operation lock and
//! bracket their work with run ledger entries: one `running` row at start,
//! exactly one terminal update at the end, on success and failure alike.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs as tokio_fs;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::backup::ledger::{BackupRun, RunLedger};
use crate::backup::lock::{LockSnapshot, OperationLock};
use crate::backup::naming;
use crate::backup::retention::{RetentionEngine, RetentionSummary};
use crate::backup::scheduler::BackupRunner;
use crate::backup::settings::{BackupSettings, SettingsStore, clamp_schedule};
use crate::backup::setup::{SetupOrchestrator, SetupRequest};
use crate::backup::tools::{ResolvedTool, ToolKind, ToolResolver};
use crate::backup::{Actor, BackupError, Result, RunAction, RunMode, RunStatus};
use crate::config::Config;
use crate::db::{AppPool, connect_single};

/// Listing cap for the artifacts endpoint
const ARTIFACT_LIST_CAP: usize = 100;

/// Result of a completed backup run
#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub prefix: String,
    pub dump_file: String,
    pub dump_size: u64,
    pub globals_file: String,
    pub globals_size: u64,
    pub retention: RetentionSummary,
}

/// One dump file visible to collaborators
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// Most recent run per action/mode pair
#[derive(Debug, Clone, Serialize)]
pub struct LatestRuns {
    pub backup_manual: Option<BackupRun>,
    pub backup_automatic: Option<BackupRun>,
    pub restore: Option<BackupRun>,
    pub setup: Option<BackupRun>,
}

/// Engine state exposed to collaborators
#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub lock: LockSnapshot,
    pub enabled: bool,
    pub configured: bool,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub schedule_hour: u8,
    pub schedule_minute: u8,
    pub retention_policy: String,
    pub encryption_using_fallback: bool,
    pub next_backup_at: Option<DateTime<Local>>,
    pub latest_runs: LatestRuns,
}

/// Settings fields collaborators may update directly
#[derive(Clone, Deserialize)]
pub struct ConfigUpdate {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub backup_user: String,
    /// `None` keeps the stored password
    #[serde(default)]
    pub backup_password: Option<String>,
    pub schedule_hour: u8,
    pub schedule_minute: u8,
}

/// The backup engine: owns the lock, the retention pass, and the
/// orchestration of external tool processes.
pub struct BackupEngine {
    config: Config,
    settings: Arc<dyn SettingsStore>,
    ledger: Arc<dyn RunLedger>,
    tools: Arc<ToolResolver>,
    retention: RetentionEngine,
    lock: OperationLock,
    app_pool: Arc<dyn AppPool>,
    setup: SetupOrchestrator,
    encryption_using_fallback: bool,
}

impl BackupEngine {
    pub fn new(
        config: Config,
        settings: Arc<dyn SettingsStore>,
        ledger: Arc<dyn RunLedger>,
        tools: Arc<ToolResolver>,
        app_pool: Arc<dyn AppPool>,
        encryption_using_fallback: bool,
    ) -> Self {
        let lock = OperationLock::new();
        let retention = RetentionEngine::new(config.backup_dir.clone());
        let setup = SetupOrchestrator::new(settings.clone(), ledger.clone(), lock.clone());

        Self {
            config,
            settings,
            ledger,
            tools,
            retention,
            lock,
            app_pool,
            setup,
            encryption_using_fallback,
        }
    }

    pub fn lock(&self) -> &OperationLock {
        &self.lock
    }

    /// Run a full backup: logical dump, globals dump, manifest, retention.
    pub async fn create_backup(
        &self,
        mode: RunMode,
        actor: Option<Actor>,
    ) -> Result<BackupOutcome> {
        let guard = self.lock.try_acquire("backup")?;
        let run_id = self.ledger.open(RunAction::Backup, mode, actor).await?;

        match self.perform_backup().await {
            Ok(outcome) => {
                info!(prefix = %outcome.prefix, "backup completed");
                self.ledger
                    .finish(
                        run_id,
                        RunStatus::Success,
                        format!("backup {} completed", outcome.prefix),
                        serde_json::to_value(&outcome)?,
                    )
                    .await?;
                Ok(outcome)
            }
            Err(e) => {
                error!(error = %e, "backup failed");
                guard.record_error(&e.to_string());
                self.ledger
                    .finish(run_id, RunStatus::Error, e.to_string(), json!({}))
                    .await?;
                Err(e)
            }
        }
    }

    async fn perform_backup(&self) -> Result<BackupOutcome> {
        let settings = self.settings.read().await?;
        if !settings.configured() {
            return Err(BackupError::NotConfigured);
        }
        if !settings.connection_complete() {
            return Err(BackupError::IncompleteSettings(String::from(
                "host, port, and database name are required",
            )));
        }

        let dump_tool = self
            .tools
            .resolve(ToolKind::Dump)
            .await
            .ok_or(BackupError::ToolNotFound { tool: "pg_dump" })?;
        let dump_all_tool = self
            .tools
            .resolve(ToolKind::DumpAll)
            .await
            .ok_or(BackupError::ToolNotFound { tool: "pg_dumpall" })?;

        tokio_fs::create_dir_all(&self.config.backup_dir).await?;

        let now = Local::now();
        let prefix = naming::artifact_prefix(&settings.database_name, now);
        let dump_name = naming::dump_file_name(&prefix);
        let globals_name = naming::globals_file_name(&prefix);
        let dump_path = self.config.backup_dir.join(&dump_name);
        let globals_path = self.config.backup_dir.join(&globals_name);

        // Full logical dump, written by the tool itself.
        let mut dump_args = connection_args(&settings);
        dump_args.extend([
            String::from("--format=custom"),
            String::from("--no-owner"),
            String::from("--no-privileges"),
            String::from("--file"),
            dump_path.display().to_string(),
            settings.database_name.clone(),
        ]);
        run_tool(&dump_tool, &dump_args, &settings.password).await?;

        // Globals (roles/tablespaces) arrive on stdout and are written verbatim.
        let mut globals_args = connection_args(&settings);
        globals_args.push(String::from("--globals-only"));
        let globals_output = run_tool(&dump_all_tool, &globals_args, &settings.password).await?;
        tokio_fs::write(&globals_path, &globals_output.stdout).await?;

        let dump_size = tokio_fs::metadata(&dump_path).await?.len();
        let globals_size = tokio_fs::metadata(&globals_path).await?.len();

        let manifest = json!({
            "prefix": prefix,
            "created_at": now.to_rfc3339(),
            "host": settings.host,
            "database": settings.database_name,
            "files": {
                "dump": { "name": dump_name, "size_bytes": dump_size },
                "globals": { "name": globals_name, "size_bytes": globals_size },
            },
            "tools": {
                "pg_dump": dump_tool.version_label(),
                "pg_dumpall": dump_all_tool.version_label(),
            },
            "engine_version": env!("CARGO_PKG_VERSION"),
        });
        let mut manifest_text = serde_json::to_string_pretty(&manifest)?;
        manifest_text.push('\n');
        let manifest_path = self.config.backup_dir.join(naming::manifest_file_name(&prefix));
        tokio_fs::write(&manifest_path, manifest_text).await?;

        let retention = self.retention.enforce(Local::now()).await?;

        Ok(BackupOutcome {
            prefix,
            dump_file: dump_name,
            dump_size,
            globals_file: globals_name,
            globals_size,
            retention,
        })
    }

    /// Restore a dump by file name, optionally replaying the companion
    /// globals script first. Destructive and never retried automatically.
    pub async fn restore_backup(
        &self,
        file_name: String,
        include_globals: bool,
        actor: Option<Actor>,
    ) -> Result<()> {
        let guard = self.lock.try_acquire("restore")?;
        let run_id = self.ledger.open(RunAction::Restore, RunMode::Manual, actor).await?;

        match self.perform_restore(&file_name, include_globals).await {
            Ok(details) => {
                info!(file = %file_name, "restore completed");
                self.ledger
                    .finish(
                        run_id,
                        RunStatus::Success,
                        format!("restore of {} completed", file_name),
                        details,
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, file = %file_name, "restore failed");
                guard.record_error(&e.to_string());
                self.ledger
                    .finish(run_id, RunStatus::Error, e.to_string(), json!({}))
                    .await?;
                Err(e)
            }
        }
    }

    async fn perform_restore(
        &self,
        file_name: &str,
        include_globals: bool,
    ) -> Result<serde_json::Value> {
        // Validated before the filesystem is consulted at all.
        if !naming::is_safe_dump_name(file_name) {
            return Err(BackupError::InvalidFileName {
                name: file_name.to_string(),
            });
        }
        let prefix = file_name
            .strip_suffix(naming::DUMP_SUFFIX)
            .unwrap_or(file_name);

        let settings = self.settings.read().await?;
        if !settings.configured() {
            return Err(BackupError::NotConfigured);
        }
        if !settings.connection_complete() {
            return Err(BackupError::IncompleteSettings(String::from(
                "host, port, and database name are required",
            )));
        }

        let restore_tool = self
            .tools
            .resolve(ToolKind::Restore)
            .await
            .ok_or(BackupError::ToolNotFound { tool: "pg_restore" })?;
        let psql_tool = self
            .tools
            .resolve(ToolKind::InteractiveSql)
            .await
            .ok_or(BackupError::ToolNotFound { tool: "psql" })?;
        let build_tool = self
            .tools
            .resolve(ToolKind::BuildTool)
            .await
            .ok_or(BackupError::ToolNotFound { tool: "sqlx" })?;

        let dump_path = self.config.backup_dir.join(file_name);
        if !dump_path.is_file() {
            return Err(BackupError::MissingArtifact {
                path: dump_path.display().to_string(),
            });
        }
        let globals_path = if include_globals {
            let path = self.config.backup_dir.join(naming::globals_file_name(prefix));
            if !path.is_file() {
                return Err(BackupError::MissingArtifact {
                    path: path.display().to_string(),
                });
            }
            Some(path)
        } else {
            None
        };

        // Nothing of ours may hold a connection while the dump is replayed.
        self.app_pool.release().await;

        let replay = self
            .run_restore_commands(
                &settings,
                &restore_tool,
                &psql_tool,
                &build_tool,
                &dump_path,
                globals_path.as_deref(),
            )
            .await;

        // The terminal ledger update needs a live pool, so the rebuild runs
        // on the failure path too.
        let rebuilt = self.app_pool.rebuild().await;
        replay?;
        rebuilt?;
        self.app_pool.ping().await?;

        Ok(json!({
            "file": file_name,
            "include_globals": include_globals,
            "database": settings.database_name,
        }))
    }

    async fn run_restore_commands(
        &self,
        settings: &BackupSettings,
        restore_tool: &ResolvedTool,
        psql_tool: &ResolvedTool,
        build_tool: &ResolvedTool,
        dump_path: &Path,
        globals_path: Option<&Path>,
    ) -> Result<()> {
        // Kick every other session off the target database.
        let terminate_sql = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid()",
            settings.database_name.replace('\'', "''"),
        );
        let mut terminate_args = connection_args(settings);
        terminate_args.extend([
            String::from("--dbname"),
            String::from("postgres"),
            String::from("--command"),
            terminate_sql,
        ]);
        run_tool(psql_tool, &terminate_args, &settings.password).await?;

        if let Some(globals) = globals_path {
            let mut globals_args = connection_args(settings);
            globals_args.extend([
                String::from("--dbname"),
                String::from("postgres"),
                String::from("--file"),
                globals.display().to_string(),
            ]);
            run_tool(psql_tool, &globals_args, &settings.password).await?;
        }

        let mut restore_args = vec![
            String::from("--clean"),
            String::from("--if-exists"),
            String::from("--no-owner"),
            String::from("--no-privileges"),
        ];
        restore_args.extend(connection_args(settings));
        restore_args.extend([
            String::from("--dbname"),
            settings.database_name.clone(),
            dump_path.display().to_string(),
        ]);
        run_tool(restore_tool, &restore_args, &settings.password).await?;

        // Reconcile schema objects created after the dump was taken.
        let migrate_args = [String::from("migrate"), String::from("run")];
        let mut cmd = Command::new(&build_tool.program);
        cmd.args(&migrate_args)
            .current_dir(&self.config.app_root)
            .env("DATABASE_URL", &self.config.database_url);
        let output = cmd.output().await.map_err(|e| BackupError::Tool {
            tool: build_tool.kind.command_name().to_string(),
            message: format!("failed to start: {}", e),
        })?;
        if !output.status.success() {
            return Err(tool_failure(build_tool, &output));
        }

        Ok(())
    }

    /// Lock state, schedule, latest runs, and the next scheduled instant.
    pub async fn status(&self) -> Result<EngineStatus> {
        let settings = self.settings.read().await?;
        let latest_runs = LatestRuns {
            backup_manual: self.ledger.latest(RunAction::Backup, RunMode::Manual).await?,
            backup_automatic: self
                .ledger
                .latest(RunAction::Backup, RunMode::Automatic)
                .await?,
            restore: self.ledger.latest(RunAction::Restore, RunMode::Manual).await?,
            setup: self.ledger.latest(RunAction::Setup, RunMode::Manual).await?,
        };

        Ok(EngineStatus {
            lock: self.lock.snapshot(),
            enabled: settings.enabled,
            configured: settings.configured(),
            host: settings.host.clone(),
            port: settings.port,
            database_name: settings.database_name.clone(),
            schedule_hour: settings.schedule_hour,
            schedule_minute: settings.schedule_minute,
            retention_policy: settings.retention_policy.clone(),
            encryption_using_fallback: self.encryption_using_fallback,
            next_backup_at: next_scheduled(&settings, Local::now()),
            latest_runs,
        })
    }

    /// Dump files with safe names, newest first, capped at 100 entries.
    /// Oddly named files are excluded here even though retention still
    /// manages them.
    pub async fn list_artifacts(&self) -> Result<Vec<ArtifactEntry>> {
        if !self.config.backup_dir.exists() {
            return Ok(Vec::new());
        }

        let mut artifacts = Vec::new();
        let mut entries = tokio_fs::read_dir(&self.config.backup_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !naming::is_safe_dump_name(&name) {
                continue;
            }
            let metadata = entry.metadata().await?;
            let modified_at: DateTime<Utc> = metadata
                .modified()
                .map(Into::into)
                .unwrap_or_else(|_| Utc::now());
            artifacts.push(ArtifactEntry {
                name,
                size_bytes: metadata.len(),
                modified_at,
            });
        }

        artifacts.sort_by(|a, b| {
            b.modified_at
                .cmp(&a.modified_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        artifacts.truncate(ARTIFACT_LIST_CAP);
        Ok(artifacts)
    }

    /// Update the stored settings, re-encrypting the password on write.
    /// The new descriptor gets a best-effort connectivity probe first.
    pub async fn update_config(&self, update: ConfigUpdate, actor: Option<Actor>) -> Result<()> {
        let current = self.settings.read().await?;
        let (schedule_hour, schedule_minute) =
            clamp_schedule(update.schedule_hour as i64, update.schedule_minute as i64);
        let password = update
            .backup_password
            .unwrap_or_else(|| current.password.clone());

        let settings = BackupSettings {
            enabled: update.enabled,
            host: update.host,
            port: update.port,
            database_name: update.database_name,
            backup_user: update.backup_user,
            password,
            schedule_hour,
            schedule_minute,
            ..current
        };

        if settings.connection_complete()
            && !settings.backup_user.is_empty()
            && !settings.password.is_empty()
        {
            match connect_single(
                &settings.host,
                settings.port,
                &settings.database_name,
                &settings.backup_user,
                &settings.password,
            )
            .await
            {
                Ok(probe) => probe.close().await,
                Err(e) => {
                    warn!(error = %e, host = %settings.host, "connectivity probe failed for new backup settings");
                }
            }
        }

        self.settings
            .write(settings, actor.map(|a| a.email))
            .await
    }

    /// Provision or rotate the backup role with administrator credentials.
    pub async fn setup_credentials(
        &self,
        request: SetupRequest,
        actor: Option<Actor>,
    ) -> Result<()> {
        self.setup.provision(request, actor).await
    }
}

#[async_trait]
impl BackupRunner for BackupEngine {
    async fn run_automatic_backup(&self) -> Result<()> {
        self.create_backup(RunMode::Automatic, None).await.map(|_| ())
    }
}

/// Today's scheduled instant, or tomorrow's once it has passed.
pub fn next_scheduled(
    settings: &BackupSettings,
    now: DateTime<Local>,
) -> Option<DateTime<Local>> {
    if !settings.enabled || !settings.configured() {
        return None;
    }
    let today = now.date_naive().and_hms_opt(
        settings.schedule_hour as u32,
        settings.schedule_minute as u32,
        0,
    )?;
    let target = if now.naive_local() <= today {
        today
    } else {
        today + Duration::days(1)
    };
    target.and_local_timezone(Local).earliest()
}

fn connection_args(settings: &BackupSettings) -> Vec<String> {
    vec![
        String::from("--host"),
        settings.host.clone(),
        String::from("--port"),
        settings.port.to_string(),
        String::from("--username"),
        settings.backup_user.clone(),
    ]
}

fn tool_failure(tool: &ResolvedTool, output: &std::process::Output) -> BackupError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("exit status {}", output.status)
    } else {
        stderr
    };
    BackupError::Tool {
        tool: tool.kind.command_name().to_string(),
        message,
    }
}

/// Run one external tool to completion, with the backup role password in
/// the child environment. Non-zero exit surfaces stderr verbatim.
async fn run_tool(
    tool: &ResolvedTool,
    args: &[String],
    password: &str,
) -> Result<std::process::Output> {
    let mut cmd = Command::new(&tool.program);
    cmd.args(args).env("PGPASSWORD", password);

    let output = cmd.output().await.map_err(|e| BackupError::Tool {
        tool: tool.kind.command_name().to_string(),
        message: format!("failed to start: {}", e),
    })?;

    if !output.status.success() {
        return Err(tool_failure(tool, &output));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::ledger::MockRunLedger;
    use crate::backup::settings::MockSettingsStore;
    use crate::db::MockAppPool;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn engine_with(
        backup_dir: &Path,
        settings: MockSettingsStore,
        ledger: MockRunLedger,
        pool: MockAppPool,
    ) -> BackupEngine {
        let config = Config {
            database_url: String::from("postgres://db1/app"),
            backup_dir: backup_dir.to_path_buf(),
            ..Config::default()
        };
        let tools = Arc::new(ToolResolver::from_config(&config));
        BackupEngine::new(
            config,
            Arc::new(settings),
            Arc::new(ledger),
            tools,
            Arc::new(pool),
            false,
        )
    }

    #[tokio::test]
    async fn test_backup_conflicts_without_a_ledger_entry() {
        let temp = tempdir().unwrap();
        // No expectations on the mocks: any ledger call would panic.
        let engine = engine_with(
            temp.path(),
            MockSettingsStore::new(),
            MockRunLedger::new(),
            MockAppPool::new(),
        );

        let _held = engine.lock().try_acquire("restore").unwrap();
        let err = engine.create_backup(RunMode::Manual, None).await.unwrap_err();
        assert!(
            matches!(err, BackupError::OperationInProgress { ref operation } if operation == "restore")
        );
    }

    #[tokio::test]
    async fn test_unconfigured_backup_marks_the_run_failed() {
        let temp = tempdir().unwrap();

        let mut settings = MockSettingsStore::new();
        settings
            .expect_read()
            .returning(|| Ok(BackupSettings::default()));

        let mut ledger = MockRunLedger::new();
        ledger.expect_open().returning(|_, _, _| Ok(11));
        ledger
            .expect_finish()
            .withf(|id, status, message, _| {
                *id == 11 && *status == RunStatus::Error && message == "backup is not configured"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let engine = engine_with(temp.path(), settings, ledger, MockAppPool::new());
        let err = engine.create_backup(RunMode::Manual, None).await.unwrap_err();
        assert!(matches!(err, BackupError::NotConfigured));
        assert!(!engine.lock().snapshot().in_progress);
    }

    #[tokio::test]
    async fn test_restore_rejects_unsafe_names_before_any_access() {
        let temp = tempdir().unwrap();

        let mut ledger = MockRunLedger::new();
        ledger.expect_open().returning(|_, _, _| Ok(7));
        ledger
            .expect_finish()
            .withf(|id, status, message, _| {
                *id == 7 && *status == RunStatus::Error && message.contains("invalid backup file name")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        // Settings and pool mocks carry no expectations: validation must
        // reject the name before either is touched.
        let engine = engine_with(temp.path(), MockSettingsStore::new(), ledger, MockAppPool::new());

        for name in ["../../etc/passwd.dump", "app;rm.dump", "app name.dump"] {
            let mut ledger = MockRunLedger::new();
            ledger.expect_open().returning(|_, _, _| Ok(7));
            ledger.expect_finish().returning(|_, _, _, _| Ok(()));
            let engine = engine_with(
                temp.path(),
                MockSettingsStore::new(),
                ledger,
                MockAppPool::new(),
            );
            let err = engine
                .restore_backup(name.to_string(), false, None)
                .await
                .unwrap_err();
            assert!(
                matches!(err, BackupError::InvalidFileName { .. }),
                "{} should be rejected",
                name
            );
        }

        let err = engine
            .restore_backup(String::from("../escape.dump"), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::InvalidFileName { .. }));
    }

    #[tokio::test]
    async fn test_list_artifacts_excludes_unsafe_names() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("app_20250601_143000.dump"), "x").unwrap();
        std::fs::write(temp.path().join("weird$name.dump"), "x").unwrap();
        std::fs::write(temp.path().join("app_20250601_143000_globals.sql"), "x").unwrap();

        let engine = engine_with(
            temp.path(),
            MockSettingsStore::new(),
            MockRunLedger::new(),
            MockAppPool::new(),
        );

        let artifacts = engine.list_artifacts().await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "app_20250601_143000.dump");
    }

    #[test]
    fn test_next_scheduled() {
        let settings = BackupSettings {
            enabled: true,
            backup_user: String::from("backup"),
            password_secret: crate::backup::vault::EncryptedSecret {
                cipher: String::from("c"),
                iv: String::from("i"),
                tag: String::from("t"),
            },
            schedule_hour: 1,
            schedule_minute: 0,
            ..BackupSettings::default()
        };

        let before = Local.with_ymd_and_hms(2025, 6, 1, 0, 30, 0).unwrap();
        let next = next_scheduled(&settings, before).unwrap();
        assert_eq!(next, Local.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap());

        let after = Local.with_ymd_and_hms(2025, 6, 1, 1, 5, 0).unwrap();
        let next = next_scheduled(&settings, after).unwrap();
        assert_eq!(next, Local.with_ymd_and_hms(2025, 6, 2, 1, 0, 0).unwrap());

        let disabled = BackupSettings {
            enabled: false,
            ..settings
        };
        assert!(next_scheduled(&disabled, before).is_none());
    }
}
