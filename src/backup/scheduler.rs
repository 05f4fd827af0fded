//! Minute-granularity scheduler for automatic backups.
//!
//! Each tick checks, in order: its own re-entrancy guard, the operation
//! lock, the stored settings, today's scheduled instant, and the run
//! ledger. At most one automatic backup succeeds per calendar day, even
//! across process restarts, because the ledger is consulted rather than
//! in-memory state. Tick failures are logged and swallowed; nothing awaits
//! a tick's result.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backup::ledger::RunLedger;
use crate::backup::lock::OperationLock;
use crate::backup::settings::SettingsStore;
use crate::backup::{Result, RunAction};

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Clock source, injected so tests can use virtual time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// Wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// What the scheduler triggers when a backup is due
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackupRunner: Send + Sync {
    async fn run_automatic_backup(&self) -> Result<()>;
}

pub struct Scheduler {
    settings: Arc<dyn SettingsStore>,
    ledger: Arc<dyn RunLedger>,
    runner: Arc<dyn BackupRunner>,
    lock: OperationLock,
    clock: Arc<dyn Clock>,
    ticking: AtomicBool,
}

impl Scheduler {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        ledger: Arc<dyn RunLedger>,
        runner: Arc<dyn BackupRunner>,
        lock: OperationLock,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            ledger,
            runner,
            lock,
            clock,
            ticking: AtomicBool::new(false),
        }
    }

    /// Start the timer loop. The returned handle is aborted on shutdown.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }

    /// One scheduler pass. Never returns an error to the caller.
    pub async fn tick(&self) {
        // Re-entrancy guard for the tick itself, independent of the
        // operation lock.
        if self.ticking.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.try_tick().await {
            warn!(error = %e, "scheduler tick failed");
        }
        self.ticking.store(false, Ordering::SeqCst);
    }

    async fn try_tick(&self) -> Result<()> {
        if self.lock.snapshot().in_progress {
            return Ok(());
        }

        let settings = self.settings.read().await?;
        if !settings.enabled || !settings.configured() {
            return Ok(());
        }

        let now = self.clock.now();
        let Some(scheduled) = now.date_naive().and_hms_opt(
            settings.schedule_hour as u32,
            settings.schedule_minute as u32,
            0,
        ) else {
            return Ok(());
        };
        if now.naive_local() < scheduled {
            return Ok(());
        }

        let midnight = now.date_naive().and_time(NaiveTime::MIN);
        let Some(midnight) = Local.from_local_datetime(&midnight).earliest() else {
            return Ok(());
        };
        if self
            .ledger
            .automatic_success_since(RunAction::Backup, midnight)
            .await?
        {
            return Ok(());
        }

        info!(
            hour = settings.schedule_hour,
            minute = settings.schedule_minute,
            "scheduled backup due, triggering automatic run"
        );
        self.runner.run_automatic_backup().await
    }
}
