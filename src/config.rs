use std::env;
use std::path::PathBuf;

/// Configuration for the backup engine process
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection URL of the application database
    pub database_url: String,
    /// Directory holding dump/globals/manifest artifact files
    pub backup_dir: PathBuf,
    /// Application root, used for the bundled tool directory and as the
    /// working directory of the migration command
    pub app_root: PathBuf,
    /// Bind address for the HTTP facade
    pub listen_addr: String,
    /// Operator-supplied encryption secret; when unset a fallback key is
    /// derived and flagged on the status surface
    pub encryption_secret: Option<String>,
    /// Session cookie name, mixed into the fallback key derivation
    pub session_cookie_name: String,
    /// Directory searched for tool binaries before the bundled vendor dir
    pub tool_bin_dir: Option<PathBuf>,
    /// Explicit full-path overrides for individual tools
    pub pg_dump_path: Option<PathBuf>,
    pub pg_dumpall_path: Option<PathBuf>,
    pub pg_restore_path: Option<PathBuf>,
    pub psql_path: Option<PathBuf>,
    pub migrate_tool_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            backup_dir: PathBuf::from("./backups"),
            app_root: PathBuf::from("."),
            listen_addr: String::from("0.0.0.0:8080"),
            encryption_secret: None,
            session_cookie_name: String::from("custodian_session"),
            tool_bin_dir: None,
            pg_dump_path: None,
            pg_dumpall_path: None,
            pg_restore_path: None,
            psql_path: None,
            migrate_tool_path: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: env::var("DATABASE_URL").unwrap_or_default(),
            backup_dir: env::var("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_dir),
            app_root: env::var("APP_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.app_root),
            listen_addr: env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            encryption_secret: env::var("BACKUP_ENCRYPTION_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            session_cookie_name: env::var("SESSION_COOKIE_NAME")
                .unwrap_or(defaults.session_cookie_name),
            tool_bin_dir: env::var("BACKUP_TOOL_BIN_DIR").map(PathBuf::from).ok(),
            pg_dump_path: env::var("PG_DUMP_PATH").map(PathBuf::from).ok(),
            pg_dumpall_path: env::var("PG_DUMPALL_PATH").map(PathBuf::from).ok(),
            pg_restore_path: env::var("PG_RESTORE_PATH").map(PathBuf::from).ok(),
            psql_path: env::var("PSQL_PATH").map(PathBuf::from).ok(),
            migrate_tool_path: env::var("MIGRATE_TOOL_PATH").map(PathBuf::from).ok(),
        }
    }

    /// Ensure the backup directory exists
    pub fn ensure_backup_dir(&self) -> std::io::Result<()> {
        if !self.backup_dir.exists() {
            std::fs::create_dir_all(&self.backup_dir)?;
        }
        Ok(())
    }

    /// Name of the application database, taken from the connection URL.
    /// Feeds the fallback key derivation in the credential vault.
    pub fn database_name(&self) -> String {
        self.database_url
            .rsplit('/')
            .next()
            .unwrap_or("")
            .split('?')
            .next()
            .unwrap_or("")
            .to_string()
    }
}
