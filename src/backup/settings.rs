//! Backup settings: the singleton row holding the target connection,
//! encrypted backup-role password, and daily schedule.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::backup::Result;
use crate::backup::vault::{CredentialVault, EncryptedSecret};
use crate::db::SqlxAppPool;

/// Normalized backup settings. `password` is the decrypted cleartext and
/// exists only in memory for the orchestrators that spawn tool processes;
/// it is never serialized.
#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub backup_user: String,
    pub password: String,
    pub password_secret: EncryptedSecret,
    pub schedule_hour: u8,
    pub schedule_minute: u8,
    pub task_name: String,
    pub retention_policy: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 5432,
            database_name: String::new(),
            backup_user: String::new(),
            password: String::new(),
            password_secret: EncryptedSecret::default(),
            schedule_hour: 1,
            schedule_minute: 0,
            task_name: String::from("nightly-backup"),
            retention_policy: String::from("three generations: day, day-1, week-1"),
            updated_at: None,
            updated_by: None,
        }
    }
}

impl BackupSettings {
    /// A target is configured once the backup role and all three encrypted
    /// password fields are present.
    pub fn configured(&self) -> bool {
        !self.backup_user.is_empty() && !self.password_secret.is_empty()
    }

    /// Whether the connection descriptor is fully populated.
    pub fn connection_complete(&self) -> bool {
        !self.host.is_empty() && self.port != 0 && !self.database_name.is_empty()
    }
}

/// Clamp persisted schedule fields into their valid ranges.
pub fn clamp_schedule(hour: i64, minute: i64) -> (u8, u8) {
    (hour.clamp(0, 23) as u8, minute.clamp(0, 59) as u8)
}

/// Read/write contract for the settings singleton
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Load and normalize the singleton row. A missing row yields defaults;
    /// an undecryptable password yields an empty one.
    async fn read(&self) -> Result<BackupSettings>;

    /// Upsert the singleton row, re-encrypting the password on every write
    /// and stamping the audit fields.
    async fn write(&self, settings: BackupSettings, updated_by: Option<String>) -> Result<()>;
}

/// PostgreSQL-backed settings store
pub struct PgSettingsStore {
    pool: Arc<SqlxAppPool>,
    vault: Arc<CredentialVault>,
}

impl PgSettingsStore {
    pub fn new(pool: Arc<SqlxAppPool>, vault: Arc<CredentialVault>) -> Self {
        Self { pool, vault }
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn read(&self) -> Result<BackupSettings> {
        let pool = self.pool.current().await;
        let row = sqlx::query(
            r#"
            SELECT enabled, host, port, database_name, backup_user,
                   password_cipher, password_iv, password_tag,
                   schedule_hour, schedule_minute, task_name, retention_policy,
                   updated_at, updated_by
            FROM backup_settings
            WHERE id = 1
            "#,
        )
        .fetch_optional(&pool)
        .await?;

        let Some(row) = row else {
            return Ok(BackupSettings::default());
        };

        let password_secret = EncryptedSecret {
            cipher: row.try_get("password_cipher")?,
            iv: row.try_get("password_iv")?,
            tag: row.try_get("password_tag")?,
        };
        let password = self.vault.decrypt(&password_secret);

        let (schedule_hour, schedule_minute) = clamp_schedule(
            row.try_get::<i16, _>("schedule_hour")? as i64,
            row.try_get::<i16, _>("schedule_minute")? as i64,
        );

        Ok(BackupSettings {
            enabled: row.try_get("enabled")?,
            host: row.try_get("host")?,
            port: u16::try_from(row.try_get::<i32, _>("port")?).unwrap_or(5432),
            database_name: row.try_get("database_name")?,
            backup_user: row.try_get("backup_user")?,
            password,
            password_secret,
            schedule_hour,
            schedule_minute,
            task_name: row.try_get("task_name")?,
            retention_policy: row.try_get("retention_policy")?,
            updated_at: row.try_get("updated_at")?,
            updated_by: row.try_get("updated_by")?,
        })
    }

    async fn write(&self, settings: BackupSettings, updated_by: Option<String>) -> Result<()> {
        let secret = if settings.password.is_empty() {
            EncryptedSecret::default()
        } else {
            self.vault.encrypt(&settings.password)?
        };

        let (schedule_hour, schedule_minute) = clamp_schedule(
            settings.schedule_hour as i64,
            settings.schedule_minute as i64,
        );

        let pool = self.pool.current().await;
        sqlx::query(
            r#"
            INSERT INTO backup_settings (
                id, enabled, host, port, database_name, backup_user,
                password_cipher, password_iv, password_tag,
                schedule_hour, schedule_minute, task_name, retention_policy,
                updated_at, updated_by
            )
            VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now(), $13)
            ON CONFLICT (id) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                host = EXCLUDED.host,
                port = EXCLUDED.port,
                database_name = EXCLUDED.database_name,
                backup_user = EXCLUDED.backup_user,
                password_cipher = EXCLUDED.password_cipher,
                password_iv = EXCLUDED.password_iv,
                password_tag = EXCLUDED.password_tag,
                schedule_hour = EXCLUDED.schedule_hour,
                schedule_minute = EXCLUDED.schedule_minute,
                task_name = EXCLUDED.task_name,
                retention_policy = EXCLUDED.retention_policy,
                updated_at = now(),
                updated_by = EXCLUDED.updated_by
            "#,
        )
        .bind(settings.enabled)
        .bind(&settings.host)
        .bind(settings.port as i32)
        .bind(&settings.database_name)
        .bind(&settings.backup_user)
        .bind(&secret.cipher)
        .bind(&secret.iv)
        .bind(&secret.tag)
        .bind(schedule_hour as i16)
        .bind(schedule_minute as i16)
        .bind(&settings.task_name)
        .bind(&settings.retention_policy)
        .bind(updated_by)
        .execute(&pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> EncryptedSecret {
        EncryptedSecret {
            cipher: String::from("c"),
            iv: String::from("i"),
            tag: String::from("t"),
        }
    }

    #[test]
    fn test_configured_requires_user_and_all_cipher_fields() {
        let full = BackupSettings {
            backup_user: String::from("backup"),
            password_secret: secret(),
            ..BackupSettings::default()
        };
        assert!(full.configured());

        let no_user = BackupSettings {
            password_secret: secret(),
            ..BackupSettings::default()
        };
        assert!(!no_user.configured());

        for blank in ["cipher", "iv", "tag"] {
            let mut partial = secret();
            match blank {
                "cipher" => partial.cipher = String::new(),
                "iv" => partial.iv = String::new(),
                _ => partial.tag = String::new(),
            }
            let settings = BackupSettings {
                backup_user: String::from("backup"),
                password_secret: partial,
                ..BackupSettings::default()
            };
            assert!(!settings.configured(), "missing {} should unconfigure", blank);
        }
    }

    #[test]
    fn test_connection_complete() {
        let settings = BackupSettings {
            host: String::from("db1"),
            port: 5432,
            database_name: String::from("app"),
            ..BackupSettings::default()
        };
        assert!(settings.connection_complete());

        assert!(!BackupSettings::default().connection_complete());
        assert!(
            !BackupSettings {
                host: String::from("db1"),
                port: 0,
                database_name: String::from("app"),
                ..BackupSettings::default()
            }
            .connection_complete()
        );
    }

    #[test]
    fn test_clamp_schedule() {
        assert_eq!(clamp_schedule(1, 0), (1, 0));
        assert_eq!(clamp_schedule(23, 59), (23, 59));
        assert_eq!(clamp_schedule(-5, 70), (0, 59));
        assert_eq!(clamp_schedule(24, -1), (23, 0));
    }
}
