//! Resolution of the external tool binaries the engine shells out to.
//!
//! Each tool is located by trying, in order: an explicit full-path
//! override, the configured tool bin directory, the bundled vendor
//! directory under the application root, and finally the bare command name
//! on the search path. Path candidates only need to exist; the bare name
//! is probed by running it with `--version`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::config::Config;

/// The five external tools the engine depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    /// Logical per-database dump (`pg_dump`)
    Dump,
    /// Cluster-wide globals dump (`pg_dumpall`)
    DumpAll,
    /// Logical restore (`pg_restore`)
    Restore,
    /// Interactive SQL client (`psql`)
    InteractiveSql,
    /// Project migration CLI (`sqlx`), run in the application root
    BuildTool,
}

impl ToolKind {
    pub fn command_name(&self) -> &'static str {
        match self {
            ToolKind::Dump => "pg_dump",
            ToolKind::DumpAll => "pg_dumpall",
            ToolKind::Restore => "pg_restore",
            ToolKind::InteractiveSql => "psql",
            ToolKind::BuildTool => "sqlx",
        }
    }

    /// Platform binary file name
    pub fn binary_name(&self) -> String {
        if cfg!(windows) {
            format!("{}.exe", self.command_name())
        } else {
            self.command_name().to_string()
        }
    }
}

/// Where a candidate came from, in resolution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCandidate {
    /// Absolute or relative path, validated by existence
    Path(PathBuf),
    /// Bare command name, validated by a `--version` probe
    Search(String),
}

/// A located tool, with the version line captured for manifests when the
/// probe succeeded.
#[derive(Debug, Clone)]
pub struct ResolvedTool {
    pub kind: ToolKind,
    pub program: PathBuf,
    pub version: Option<String>,
}

impl ResolvedTool {
    pub fn version_label(&self) -> &str {
        self.version.as_deref().unwrap_or("unknown")
    }
}

/// Locates tool binaries across overrides, directories, and the host path
pub struct ToolResolver {
    overrides: HashMap<ToolKind, PathBuf>,
    tool_bin_dir: Option<PathBuf>,
    vendor_bin_dir: PathBuf,
}

impl ToolResolver {
    pub fn from_config(config: &Config) -> Self {
        let mut overrides = HashMap::new();
        let pairs = [
            (ToolKind::Dump, &config.pg_dump_path),
            (ToolKind::DumpAll, &config.pg_dumpall_path),
            (ToolKind::Restore, &config.pg_restore_path),
            (ToolKind::InteractiveSql, &config.psql_path),
            (ToolKind::BuildTool, &config.migrate_tool_path),
        ];
        for (kind, path) in pairs {
            if let Some(path) = path {
                overrides.insert(kind, path.clone());
            }
        }

        Self {
            overrides,
            tool_bin_dir: config.tool_bin_dir.clone(),
            vendor_bin_dir: config.app_root.join("vendor").join("postgres").join("bin"),
        }
    }

    /// Candidate locations for a tool, in the order they are tried.
    pub fn candidates(&self, kind: ToolKind) -> Vec<ToolCandidate> {
        let mut candidates = Vec::new();
        if let Some(explicit) = self.overrides.get(&kind) {
            candidates.push(ToolCandidate::Path(explicit.clone()));
        }
        if let Some(bin_dir) = &self.tool_bin_dir {
            candidates.push(ToolCandidate::Path(bin_dir.join(kind.binary_name())));
        }
        candidates.push(ToolCandidate::Path(
            self.vendor_bin_dir.join(kind.binary_name()),
        ));
        candidates.push(ToolCandidate::Search(kind.command_name().to_string()));
        candidates
    }

    /// Return the first candidate that resolves, or `None`. Callers treat
    /// `None` as a hard precondition failure, never a retryable one.
    pub async fn resolve(&self, kind: ToolKind) -> Option<ResolvedTool> {
        for candidate in self.candidates(kind) {
            match candidate {
                ToolCandidate::Path(path) => {
                    if path.is_file() {
                        let version = probe_version(&path).await;
                        debug!(tool = kind.command_name(), path = %path.display(), "resolved tool");
                        return Some(ResolvedTool {
                            kind,
                            program: path,
                            version,
                        });
                    }
                }
                ToolCandidate::Search(name) => {
                    if let Some(version) = probe_version(Path::new(&name)).await {
                        debug!(tool = kind.command_name(), "resolved tool on search path");
                        return Some(ResolvedTool {
                            kind,
                            program: PathBuf::from(name),
                            version: Some(version),
                        });
                    }
                }
            }
        }
        None
    }
}

/// Run `<program> --version` and return the first stdout line on success.
async fn probe_version(program: &Path) -> Option<String> {
    let output = Command::new(program).arg("--version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_with(
        overrides: Option<PathBuf>,
        bin_dir: Option<PathBuf>,
        app_root: PathBuf,
    ) -> Config {
        Config {
            pg_dump_path: overrides,
            tool_bin_dir: bin_dir,
            app_root,
            ..Config::default()
        }
    }

    #[test]
    fn test_candidate_order() {
        let config = config_with(
            Some(PathBuf::from("/opt/pg/bin/pg_dump")),
            Some(PathBuf::from("/usr/lib/postgresql/bin")),
            PathBuf::from("/srv/app"),
        );
        let resolver = ToolResolver::from_config(&config);

        let candidates = resolver.candidates(ToolKind::Dump);
        assert_eq!(
            candidates,
            vec![
                ToolCandidate::Path(PathBuf::from("/opt/pg/bin/pg_dump")),
                ToolCandidate::Path(
                    PathBuf::from("/usr/lib/postgresql/bin").join(ToolKind::Dump.binary_name())
                ),
                ToolCandidate::Path(
                    PathBuf::from("/srv/app/vendor/postgres/bin").join(ToolKind::Dump.binary_name())
                ),
                ToolCandidate::Search(String::from("pg_dump")),
            ]
        );

        // No override for other tools: the chain starts at the bin dir.
        let candidates = resolver.candidates(ToolKind::Restore);
        assert_eq!(candidates.len(), 3);
        assert!(matches!(candidates[2], ToolCandidate::Search(ref name) if name == "pg_restore"));
    }

    #[tokio::test]
    async fn test_resolve_prefers_existing_override() {
        let temp = tempdir().unwrap();
        let fake = temp.path().join("pg_dump");
        std::fs::write(&fake, "").unwrap();

        let config = config_with(Some(fake.clone()), None, temp.path().to_path_buf());
        let resolver = ToolResolver::from_config(&config);

        let resolved = resolver.resolve(ToolKind::Dump).await.unwrap();
        assert_eq!(resolved.program, fake);
        // A plain file is not executable: the version probe fails but the
        // path candidate still resolves.
        assert_eq!(resolved.version_label(), "unknown");
    }

    #[tokio::test]
    async fn test_resolve_falls_back_past_missing_override() {
        let temp = tempdir().unwrap();
        let bin_dir = temp.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let fallback = bin_dir.join(ToolKind::Dump.binary_name());
        std::fs::write(&fallback, "").unwrap();

        let config = config_with(
            Some(temp.path().join("missing").join("pg_dump")),
            Some(bin_dir),
            temp.path().to_path_buf(),
        );
        let resolver = ToolResolver::from_config(&config);

        let resolved = resolver.resolve(ToolKind::Dump).await.unwrap();
        assert_eq!(resolved.program, fallback);
    }
}
