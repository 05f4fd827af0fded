//! Rolling retention over the backup directory.
//!
//! Dump files are classified by modification time into three one-day
//! buckets: `day` (today), `day-1` (yesterday), and `week-1` (the day
//! exactly seven days before today). The newest dump per bucket is kept;
//! every other managed file is deleted together with its companions. This
//! bounds disk usage to three dump generations regardless of backup
//! frequency while preserving day-over-day and week-over-week recovery
//! points.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Local, NaiveDateTime, NaiveTime};
use serde::Serialize;
use tokio::fs as tokio_fs;
use tracing::{debug, warn};

use crate::backup::Result;
use crate::backup::naming::{DUMP_SUFFIX, is_managed_file, prefix_of};

/// Named time window that may keep at most one artifact set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionBucket {
    Day,
    DayMinus1,
    WeekMinus1,
}

impl RetentionBucket {
    pub fn label(&self) -> &'static str {
        match self {
            RetentionBucket::Day => "day",
            RetentionBucket::DayMinus1 => "day-1",
            RetentionBucket::WeekMinus1 => "week-1",
        }
    }
}

/// One artifact set kept by the retention pass
#[derive(Debug, Clone, Serialize)]
pub struct KeptArtifact {
    pub bucket: &'static str,
    pub prefix: String,
}

/// Outcome of one retention pass. Individual delete failures are counted
/// rather than raised, so a partially cleaned directory is still reported.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionSummary {
    pub kept: Vec<KeptArtifact>,
    pub deleted: usize,
    pub failed: usize,
}

/// Classify a modification time into at most one bucket using half-open
/// day intervals relative to `now`.
fn classify(modified: NaiveDateTime, now: NaiveDateTime) -> Option<RetentionBucket> {
    let today = now.date().and_time(NaiveTime::MIN);
    let tomorrow = today + Duration::days(1);
    let yesterday = today - Duration::days(1);
    let week_ago = today - Duration::days(7);
    let week_ago_end = week_ago + Duration::days(1);

    if modified >= today && modified < tomorrow {
        Some(RetentionBucket::Day)
    } else if modified >= yesterday && modified < today {
        Some(RetentionBucket::DayMinus1)
    } else if modified >= week_ago && modified < week_ago_end {
        Some(RetentionBucket::WeekMinus1)
    } else {
        None
    }
}

/// Decide which artifact prefixes to keep. `dumps` holds dump file names
/// with their modification times; the newest file per bucket wins.
fn plan_keeps(dumps: &[(String, NaiveDateTime)], now: NaiveDateTime) -> Vec<KeptArtifact> {
    let mut ordered: Vec<&(String, NaiveDateTime)> = dumps.iter().collect();
    // Newest first; name as tie-breaker for a stable order.
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut kept: Vec<KeptArtifact> = Vec::new();
    for (name, modified) in ordered {
        let Some(bucket) = classify(*modified, now) else {
            continue;
        };
        if kept.iter().any(|k| k.bucket == bucket.label()) {
            continue;
        }
        if let Some(prefix) = prefix_of(name) {
            kept.push(KeptArtifact {
                bucket: bucket.label(),
                prefix: prefix.to_string(),
            });
        }
    }
    kept
}

/// Deletes everything outside the kept set from one backup directory.
pub struct RetentionEngine {
    backup_dir: PathBuf,
}

impl RetentionEngine {
    pub fn new(backup_dir: PathBuf) -> Self {
        Self { backup_dir }
    }

    /// Run one retention pass at `now`. Matches managed files by suffix
    /// only, intentionally looser than the safe-name pattern used for
    /// listing, so an oddly named `.dump` file is cleaned up even though
    /// listings exclude it.
    pub async fn enforce(&self, now: DateTime<Local>) -> Result<RetentionSummary> {
        if !self.backup_dir.exists() {
            return Ok(RetentionSummary::default());
        }

        let mut dumps: Vec<(String, NaiveDateTime)> = Vec::new();
        let mut managed: Vec<String> = Vec::new();

        let mut entries = tokio_fs::read_dir(&self.backup_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !is_managed_file(&name) {
                continue;
            }
            if name.ends_with(DUMP_SUFFIX) {
                let metadata = entry.metadata().await?;
                if let Ok(modified) = metadata.modified() {
                    let modified: DateTime<Local> = modified.into();
                    dumps.push((name.clone(), modified.naive_local()));
                }
            }
            managed.push(name);
        }

        let kept = plan_keeps(&dumps, now.naive_local());
        let kept_prefixes: HashSet<String> = kept.iter().map(|k| k.prefix.clone()).collect();

        let mut summary = RetentionSummary {
            kept,
            ..RetentionSummary::default()
        };

        for name in managed {
            let keep = prefix_of(&name)
                .map(|prefix| kept_prefixes.contains(prefix))
                .unwrap_or(false);
            if keep {
                continue;
            }
            match tokio_fs::remove_file(self.backup_dir.join(&name)).await {
                Ok(()) => {
                    debug!(file = %name, "retention deleted artifact file");
                    summary.deleted += 1;
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "retention failed to delete file");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs::OpenOptions;
    use std::time::{Duration as StdDuration, SystemTime};
    use tempfile::tempdir;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_classify_buckets_half_open() {
        let now = dt(2025, 3, 15, 18, 30);

        assert_eq!(classify(dt(2025, 3, 15, 0, 0), now), Some(RetentionBucket::Day));
        assert_eq!(classify(dt(2025, 3, 15, 23, 59), now), Some(RetentionBucket::Day));
        assert_eq!(
            classify(dt(2025, 3, 14, 0, 0), now),
            Some(RetentionBucket::DayMinus1)
        );
        assert_eq!(
            classify(dt(2025, 3, 8, 0, 0), now),
            Some(RetentionBucket::WeekMinus1)
        );
        assert_eq!(
            classify(dt(2025, 3, 8, 23, 59), now),
            Some(RetentionBucket::WeekMinus1)
        );

        // Outside every window: two days ago, eight days ago, the far past.
        assert_eq!(classify(dt(2025, 3, 13, 12, 0), now), None);
        assert_eq!(classify(dt(2025, 3, 7, 23, 59), now), None);
        assert_eq!(classify(dt(2025, 2, 13, 12, 0), now), None);
    }

    #[test]
    fn test_plan_keeps_newest_per_bucket() {
        let now = dt(2025, 3, 15, 18, 30);
        let dumps = vec![
            (String::from("app_20250315_183000.dump"), now),
            // Duplicate inside the day bucket: not kept.
            (String::from("app_20250315_173000.dump"), dt(2025, 3, 15, 17, 30)),
            // now - 1 day 1 hour.
            (String::from("app_20250314_173000.dump"), dt(2025, 3, 14, 17, 30)),
            // now - 7 days 12 hours.
            (String::from("app_20250308_063000.dump"), dt(2025, 3, 8, 6, 30)),
            // 30 days old: unbucketed.
            (String::from("app_20250213_120000.dump"), dt(2025, 2, 13, 12, 0)),
        ];

        let kept = plan_keeps(&dumps, now);
        let prefixes: Vec<(&str, &str)> = kept
            .iter()
            .map(|k| (k.bucket, k.prefix.as_str()))
            .collect();

        assert_eq!(
            prefixes,
            vec![
                ("day", "app_20250315_183000"),
                ("day-1", "app_20250314_173000"),
                ("week-1", "app_20250308_063000"),
            ]
        );
    }

    fn write_artifact_set(dir: &std::path::Path, prefix: &str, modified: SystemTime) {
        for name in [
            format!("{prefix}.dump"),
            format!("{prefix}_globals.sql"),
            format!("{prefix}_manifest.json"),
        ] {
            let path = dir.join(name);
            std::fs::write(&path, "x").unwrap();
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.set_modified(modified).unwrap();
        }
    }

    #[tokio::test]
    async fn test_enforce_deletes_stale_sets_and_suffix_matched_strays() {
        let temp = tempdir().unwrap();
        let dir = temp.path();
        let now = SystemTime::now();
        let old = now - StdDuration::from_secs(30 * 24 * 3600);

        write_artifact_set(dir, "app_new", now);
        write_artifact_set(dir, "app_old", old);

        // Unsafe name, excluded from listings but still managed by suffix.
        let stray = dir.join("weird$name.dump");
        std::fs::write(&stray, "x").unwrap();
        OpenOptions::new()
            .write(true)
            .open(&stray)
            .unwrap()
            .set_modified(old)
            .unwrap();

        // Not an artifact file at all: untouched.
        std::fs::write(dir.join("notes.txt"), "x").unwrap();

        let engine = RetentionEngine::new(dir.to_path_buf());
        let summary = engine.enforce(Local::now()).await.unwrap();

        assert_eq!(summary.kept.len(), 1);
        assert_eq!(summary.kept[0].prefix, "app_new");
        assert_eq!(summary.deleted, 4);
        assert_eq!(summary.failed, 0);

        assert!(dir.join("app_new.dump").exists());
        assert!(dir.join("app_new_globals.sql").exists());
        assert!(dir.join("app_new_manifest.json").exists());
        assert!(!dir.join("app_old.dump").exists());
        assert!(!dir.join("app_old_globals.sql").exists());
        assert!(!dir.join("app_old_manifest.json").exists());
        assert!(!stray.exists());
        assert!(dir.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_enforce_on_missing_directory_is_a_no_op() {
        let temp = tempdir().unwrap();
        let engine = RetentionEngine::new(temp.path().join("does-not-exist"));
        let summary = engine.enforce(Local::now()).await.unwrap();
        assert!(summary.kept.is_empty());
        assert_eq!(summary.deleted, 0);
    }
}
