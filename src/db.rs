use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};
use tokio::sync::RwLock;

use crate::backup::Result;

/// Database connection pool type
pub type DbPool = Pool<Postgres>;

/// Seam the restore orchestrator uses to tear down the application's live
/// connections before replaying a dump and to verify recovery afterwards.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AppPool: Send + Sync {
    /// Close every live connection so nothing holds a lock on the target
    /// database during a restore.
    async fn release(&self);

    /// Reconnect with a fresh pool.
    async fn rebuild(&self) -> Result<()>;

    /// Trivial liveness query against the current pool.
    async fn ping(&self) -> Result<()>;
}

/// The application pool, rebuildable in place. Collaborators fetch the
/// current pool through [`SqlxAppPool::current`] instead of holding their
/// own clone, so a rebuild takes effect everywhere at once.
pub struct SqlxAppPool {
    database_url: String,
    inner: RwLock<DbPool>,
}

impl SqlxAppPool {
    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = Self::build_pool(database_url).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;

        Ok(Self {
            database_url: database_url.to_string(),
            inner: RwLock::new(pool),
        })
    }

    async fn build_pool(database_url: &str) -> std::result::Result<DbPool, sqlx::Error> {
        let options = PgConnectOptions::from_str(database_url)?;
        PgPoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
    }

    /// The pool currently backing the application.
    pub async fn current(&self) -> DbPool {
        self.inner.read().await.clone()
    }
}

#[async_trait]
impl AppPool for SqlxAppPool {
    async fn release(&self) {
        self.inner.read().await.close().await;
    }

    async fn rebuild(&self) -> Result<()> {
        let fresh = Self::build_pool(&self.database_url).await?;
        *self.inner.write().await = fresh;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let pool = self.current().await;
        sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&pool).await?;
        Ok(())
    }
}

/// Single-connection pool for short-lived administrative sessions, used by
/// the setup orchestrator and the settings connectivity probe.
pub async fn connect_single(
    host: &str,
    port: u16,
    database: &str,
    user: &str,
    password: &str,
) -> std::result::Result<DbPool, sqlx::Error> {
    let options = PgConnectOptions::new()
        .host(host)
        .port(port)
        .database(database)
        .username(user)
        .password(password);

    PgPoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}
