//! Artifact naming: timestamp-based prefixes shared by the three files of
//! a backup artifact set, plus the safe-name validation applied to
//! user-supplied restore targets.

use chrono::{DateTime, Local};

/// Suffix of the logical dump produced by the dump tool
pub const DUMP_SUFFIX: &str = ".dump";
/// Suffix of the globals (roles/tablespaces) script
pub const GLOBALS_SUFFIX: &str = "_globals.sql";
/// Suffix of the JSON manifest sidecar
pub const MANIFEST_SUFFIX: &str = "_manifest.json";

/// Build the shared prefix for a new artifact set:
/// `{database}_{yyyyMMdd_HHmmss}`.
pub fn artifact_prefix(database_name: &str, at: DateTime<Local>) -> String {
    format!("{}_{}", database_name, at.format("%Y%m%d_%H%M%S"))
}

pub fn dump_file_name(prefix: &str) -> String {
    format!("{}{}", prefix, DUMP_SUFFIX)
}

pub fn globals_file_name(prefix: &str) -> String {
    format!("{}{}", prefix, GLOBALS_SUFFIX)
}

pub fn manifest_file_name(prefix: &str) -> String {
    format!("{}{}", prefix, MANIFEST_SUFFIX)
}

/// Strict pattern for restore targets and artifact listings:
/// `name.dump` where name uses only `[A-Za-z0-9._-]`. Anything else is
/// rejected before the filesystem is consulted, which also blocks path
/// traversal in user-supplied names.
pub fn is_safe_dump_name(name: &str) -> bool {
    name.len() > DUMP_SUFFIX.len()
        && name.ends_with(DUMP_SUFFIX)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Whether a file belongs to an artifact set, matched by suffix only.
/// Deliberately looser than [`is_safe_dump_name`]: the retention pass
/// manages every suffix-matched file even when its name would be excluded
/// from listings.
pub fn is_managed_file(name: &str) -> bool {
    name.ends_with(DUMP_SUFFIX)
        || name.ends_with(GLOBALS_SUFFIX)
        || name.ends_with(MANIFEST_SUFFIX)
}

/// Extract the shared artifact prefix from any of the three file names.
pub fn prefix_of(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(GLOBALS_SUFFIX)
        .or_else(|| file_name.strip_suffix(MANIFEST_SUFFIX))
        .or_else(|| file_name.strip_suffix(DUMP_SUFFIX))
}
