//! Source-control state captured alongside a run

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

/// Commit and working-tree state of the repository a run was invoked from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    /// `HEAD` commit hash
    pub commit: String,
    /// True when the working tree has uncommitted or untracked changes
    pub dirty: bool,
    /// `git status --porcelain` lines
    #[serde(default)]
    pub changes: Vec<String>,
}

impl GitStatus {
    /// Query the repository containing `dir`.
    ///
    /// Returns `None` when `dir` is not inside a repository with at least
    /// one commit, or when git is not installed.
    #[must_use]
    pub fn capture(dir: &Path) -> Option<Self> {
        let commit = match run_git(dir, &["rev-parse", "HEAD"]) {
            Ok(out) => out.trim().to_string(),
            Err(reason) => {
                tracing::debug!(dir = %dir.display(), %reason, "no git state recorded");
                return None;
            }
        };
        let changes: Vec<String> = match run_git(dir, &["status", "--porcelain"]) {
            Ok(out) => out.lines().filter(|l| !l.trim().is_empty()).map(str::to_string).collect(),
            Err(reason) => {
                tracing::debug!(dir = %dir.display(), %reason, "git status failed");
                return None;
            }
        };
        Some(Self {
            commit,
            dirty: !changes.is_empty(),
            changes,
        })
    }
}

/// Run one git command in `dir`; stdout on success, stderr otherwise.
fn run_git(dir: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok_and(|o| o.status.success())
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(["-c", "user.name=ledger", "-c", "user.email=ledger@example.com"])
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?}");
    }

    #[test]
    fn test_capture_commit_and_dirty_state() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-q"]);
        git(dir.path(), &["commit", "-q", "--allow-empty", "-m", "init"]);

        let head = run_git(dir.path(), &["rev-parse", "HEAD"]).unwrap();
        let clean = GitStatus::capture(dir.path()).unwrap();
        assert_eq!(clean.commit, head.trim());
        assert!(!clean.dirty);
        assert!(clean.changes.is_empty());

        std::fs::write(dir.path().join("notes.txt"), "wip").unwrap();
        let dirty = GitStatus::capture(dir.path()).unwrap();
        assert_eq!(dirty.commit, clean.commit);
        assert!(dirty.dirty);
        assert_eq!(dirty.changes, vec!["?? notes.txt".to_string()]);
    }

    #[test]
    fn test_capture_outside_repository() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("no-repo");
        std::fs::create_dir(&nested).unwrap();
        // A repository with no commits has no HEAD either.
        if git_available() {
            git(dir.path(), &["init", "-q"]);
        }
        assert_eq!(GitStatus::capture(&nested), None);
    }

    #[test]
    fn test_missing_directory() {
        assert_eq!(GitStatus::capture(Path::new("/nonexistent/trueno-lineage")), None);
    }
}
