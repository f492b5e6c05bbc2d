//! Candidate installation: materialize a package on disk and produce a
//! runnable command spec.
//!
//! The mechanism is pluggable behind [`Fetcher`]; the default
//! [`CommandFetcher`] delegates to an external package tool and is
//! deliberately thin.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::candidate::{Candidate, Source};
use crate::error::{Error, InstallStage, Result};

/// A command spec ready to be spawned as a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// A completed installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installation {
    pub candidate: Candidate,
    pub install_path: PathBuf,
    pub run_spec: RunSpec,
    pub installed_at: DateTime<Utc>,
    /// True when an existing verified install was returned as-is.
    pub reused: bool,
}

/// Materializes candidates into an install directory.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Populate `dest` with the candidate's contents.
    async fn fetch(&self, candidate: &Candidate, dest: &Path) -> Result<()>;

    /// The command spec used to launch the installed server.
    fn run_spec(&self, candidate: &Candidate, dest: &Path) -> RunSpec;
}

/// Default fetcher: shells out to the candidate's install command
/// (registry), `git clone` (git), or a recursive copy (local). Run specs
/// come from a placeholder template; `{name}`, `{version}`, `{coordinate}`
/// and `{dir}` are substituted.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    pub run_command: String,
    pub run_args: Vec<String>,
    /// Upper bound on one install command's wall time.
    pub install_timeout: std::time::Duration,
}

impl Default for CommandFetcher {
    fn default() -> Self {
        Self {
            run_command: "npx".to_string(),
            run_args: vec!["-y".to_string(), "{coordinate}".to_string()],
            install_timeout: std::time::Duration::from_secs(120),
        }
    }
}

impl CommandFetcher {
    fn substitute(template: &str, candidate: &Candidate, dest: &Path) -> String {
        template
            .replace("{coordinate}", &candidate.coordinate())
            .replace("{name}", &candidate.name)
            .replace("{version}", &candidate.version)
            .replace("{dir}", &dest.display().to_string())
    }

    async fn run_install_command(
        &self,
        argv: Vec<String>,
        dest: &Path,
    ) -> Result<()> {
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::install(InstallStage::Fetch, "empty install command"));
        };
        debug!(command = %argv.join(" "), "running install command");
        let run = Command::new(program)
            .args(args)
            .current_dir(dest)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.install_timeout, run)
            .await
            .map_err(|_| Error::install(InstallStage::Fetch, "install command timed out"))?
            .map_err(|e| Error::install(InstallStage::Fetch, e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::install(
                InstallStage::Fetch,
                format!("install command exited with {}: {tail}", output.status),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(&self, candidate: &Candidate, dest: &Path) -> Result<()> {
        match candidate.source {
            Source::Registry => {
                let argv: Vec<String> = candidate
                    .install_command
                    .split_whitespace()
                    .map(|part| Self::substitute(part, candidate, dest))
                    .collect();
                self.run_install_command(argv, dest).await
            }
            Source::Git => {
                let argv = vec![
                    "git".to_string(),
                    "clone".to_string(),
                    "--depth".to_string(),
                    "1".to_string(),
                    candidate.install_command.clone(),
                    ".".to_string(),
                ];
                self.run_install_command(argv, dest).await
            }
            Source::Local => {
                let from = PathBuf::from(&candidate.install_command);
                let to = dest.to_path_buf();
                tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                    .await
                    .map_err(|e| Error::install(InstallStage::Fetch, e.to_string()))?
            }
        }
    }

    fn run_spec(&self, candidate: &Candidate, dest: &Path) -> RunSpec {
        RunSpec {
            command: Self::substitute(&self.run_command, candidate, dest),
            args: self
                .run_args
                .iter()
                .map(|a| Self::substitute(a, candidate, dest))
                .collect(),
            env: HashMap::new(),
            cwd: Some(dest.to_path_buf()),
        }
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let fail = |e: std::io::Error| Error::install(InstallStage::Fetch, e.to_string());
    if from.is_dir() {
        for entry in std::fs::read_dir(from).map_err(fail)? {
            let entry = entry.map_err(fail)?;
            let target = to.join(entry.file_name());
            if entry.path().is_dir() {
                std::fs::create_dir_all(&target).map_err(fail)?;
                copy_tree(&entry.path(), &target)?;
            } else {
                std::fs::copy(entry.path(), &target).map_err(fail)?;
            }
        }
        Ok(())
    } else if from.is_file() {
        let target = to.join(from.file_name().unwrap_or_default());
        std::fs::copy(from, target).map_err(fail)?;
        Ok(())
    } else {
        Err(Error::install(
            InstallStage::Fetch,
            format!("local source '{}' does not exist", from.display()),
        ))
    }
}

/// Installs candidates under a root directory, one subdirectory per
/// `name@version`.
pub struct Installer {
    root: PathBuf,
    fetcher: std::sync::Arc<dyn Fetcher>,
}

impl Installer {
    pub fn new(root: impl Into<PathBuf>, fetcher: std::sync::Arc<dyn Fetcher>) -> Self {
        Self {
            root: root.into(),
            fetcher,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Install a candidate. An existing install that passes verification is
    /// returned untouched unless `force` is set. Partial installs are
    /// removed before an error is returned.
    pub async fn install(&self, candidate: &Candidate, force: bool) -> Result<Installation> {
        let dir = self.root.join(sanitize(&candidate.coordinate()));
        let run_spec = self.fetcher.run_spec(candidate, &dir);

        if dir.exists() && !force && verify(&dir, &run_spec).is_ok() {
            debug!(path = %dir.display(), "reusing existing installation");
            return Ok(Installation {
                candidate: candidate.clone(),
                install_path: dir,
                run_spec,
                installed_at: Utc::now(),
                reused: true,
            });
        }

        let prepare = |e: std::io::Error| Error::install(InstallStage::Prepare, e.to_string());
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(prepare)?;
        }
        std::fs::create_dir_all(&dir).map_err(prepare)?;

        if let Err(e) = self.fetcher.fetch(candidate, &dir).await {
            cleanup(&dir);
            return Err(e);
        }
        if let Err(e) = verify(&dir, &run_spec) {
            cleanup(&dir);
            return Err(e);
        }

        info!(coordinate = %candidate.coordinate(), path = %dir.display(), "installed");
        Ok(Installation {
            candidate: candidate.clone(),
            install_path: dir,
            run_spec,
            installed_at: Utc::now(),
            reused: false,
        })
    }
}

/// Post-install verification: the directory exists, the run command is
/// locatable, and a metadata file (when the convention exists) parses.
fn verify(dir: &Path, run_spec: &RunSpec) -> Result<()> {
    if !dir.is_dir() {
        return Err(Error::install(
            InstallStage::Verify,
            format!("install directory '{}' missing", dir.display()),
        ));
    }

    let command = Path::new(&run_spec.command);
    let locatable = if command.components().count() > 1 {
        command.is_absolute() && command.exists() || dir.join(command).exists()
    } else {
        which::which(&run_spec.command).is_ok()
    };
    if !locatable {
        return Err(Error::install(
            InstallStage::Verify,
            format!("command '{}' not locatable", run_spec.command),
        ));
    }

    let metadata = dir.join("package.json");
    if metadata.exists() {
        let raw = std::fs::read_to_string(&metadata)
            .map_err(|e| Error::install(InstallStage::Verify, e.to_string()))?;
        serde_json::from_str::<serde_json::Value>(&raw).map_err(|e| {
            Error::install(InstallStage::Verify, format!("package.json: {e}"))
        })?;
    }
    Ok(())
}

fn cleanup(dir: &Path) {
    let _ = std::fs::remove_dir_all(dir);
}

/// Directory-safe rendering of a coordinate.
fn sanitize(coordinate: &str) -> String {
    coordinate
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn candidate(name: &str) -> Candidate {
        Candidate {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            source: Source::Registry,
            install_command: String::new(),
            capabilities: BTreeSet::new(),
            relevance_score: 1.0,
            quality_score: 1.0,
        }
    }

    /// Writes a marker file and points the run spec at `sh`.
    struct MarkerFetcher {
        fetches: AtomicUsize,
        fail_fetch: bool,
        command: String,
    }

    impl MarkerFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                fail_fetch: false,
                command: "sh".to_string(),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                fail_fetch: true,
                command: "sh".to_string(),
            })
        }

        fn unlocatable() -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                fail_fetch: false,
                command: "definitely-not-a-real-command-qm".to_string(),
            })
        }
    }

    #[async_trait]
    impl Fetcher for MarkerFetcher {
        async fn fetch(&self, _candidate: &Candidate, dest: &Path) -> Result<()> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetch {
                return Err(Error::install(InstallStage::Fetch, "synthetic failure"));
            }
            std::fs::write(dest.join("marker"), b"ok")
                .map_err(|e| Error::install(InstallStage::Fetch, e.to_string()))
        }

        fn run_spec(&self, _candidate: &Candidate, dest: &Path) -> RunSpec {
            RunSpec {
                command: self.command.clone(),
                args: vec!["-c".to_string(), "true".to_string()],
                env: HashMap::new(),
                cwd: Some(dest.to_path_buf()),
            }
        }
    }

    #[tokio::test]
    async fn install_materializes_and_verifies() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = MarkerFetcher::new();
        let installer = Installer::new(root.path(), fetcher.clone() as Arc<dyn Fetcher>);

        let installation = installer.install(&candidate("mcp-a"), false).await.unwrap();
        assert!(!installation.reused);
        assert!(installation.install_path.join("marker").exists());
        assert_eq!(installation.run_spec.command, "sh");
    }

    #[tokio::test]
    async fn reinstall_is_idempotent_unless_forced() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = MarkerFetcher::new();
        let installer = Installer::new(root.path(), fetcher.clone() as Arc<dyn Fetcher>);
        let candidate = candidate("mcp-b");

        let first = installer.install(&candidate, false).await.unwrap();
        let second = installer.install(&candidate, false).await.unwrap();
        assert_eq!(first.install_path, second.install_path);
        assert!(second.reused);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

        let forced = installer.install(&candidate, true).await.unwrap();
        assert!(!forced.reused);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_failure_cleans_partial_install() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = MarkerFetcher::failing();
        let installer = Installer::new(root.path(), fetcher as Arc<dyn Fetcher>);

        let err = installer.install(&candidate("mcp-c"), false).await.unwrap_err();
        assert_eq!(err.install_stage(), Some(InstallStage::Fetch));
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn unlocatable_command_fails_verify_and_cleans() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = MarkerFetcher::unlocatable();
        let installer = Installer::new(root.path(), fetcher as Arc<dyn Fetcher>);

        let err = installer.install(&candidate("mcp-d"), false).await.unwrap_err();
        assert_eq!(err.install_stage(), Some(InstallStage::Verify));
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn malformed_metadata_fails_verify() {
        let root = tempfile::tempdir().unwrap();

        struct BadMetadata;
        #[async_trait]
        impl Fetcher for BadMetadata {
            async fn fetch(&self, _c: &Candidate, dest: &Path) -> Result<()> {
                std::fs::write(dest.join("package.json"), b"{not json")
                    .map_err(|e| Error::install(InstallStage::Fetch, e.to_string()))
            }
            fn run_spec(&self, _c: &Candidate, dest: &Path) -> RunSpec {
                RunSpec {
                    command: "sh".to_string(),
                    args: vec![],
                    env: HashMap::new(),
                    cwd: Some(dest.to_path_buf()),
                }
            }
        }

        let installer = Installer::new(root.path(), Arc::new(BadMetadata) as Arc<dyn Fetcher>);
        let err = installer.install(&candidate("mcp-e"), false).await.unwrap_err();
        assert_eq!(err.install_stage(), Some(InstallStage::Verify));
    }

    #[test]
    fn sanitize_scoped_names() {
        assert_eq!(
            sanitize("@scope/server-files@1.2.3"),
            "@scope_server-files@1.2.3"
        );
    }

    #[test]
    fn substitution_fills_placeholders() {
        let c = candidate("mcp-f");
        let dest = Path::new("/tmp/x");
        assert_eq!(
            CommandFetcher::substitute("{coordinate}", &c, dest),
            "mcp-f@1.0.0"
        );
        assert_eq!(CommandFetcher::substitute("{dir}/bin", &c, dest), "/tmp/x/bin");
    }
}
