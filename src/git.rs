use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// The few git operations the tracker leans on.
///
/// Everything here degrades gracefully: no git binary, no repository, or a
/// file git has never seen all come back as `None`/`false` and callers fall
/// back to plain filesystem behavior.
pub trait GitOps {
    /// Toplevel of the repository containing `path`, if any.
    fn repo_root(&self, path: &Path) -> Option<PathBuf>;

    /// Author time of the commit that first added `path`.
    fn first_commit_time(&self, path: &Path) -> Option<DateTime<Utc>>;

    /// `git mv`. Returns true when git performed the move.
    fn mv(&self, from: &Path, to: &Path) -> bool;

    /// `git rm`. Returns true when git removed the file.
    fn rm(&self, path: &Path) -> bool;
}

/// Shells out to the `git` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGit;

impl GitOps for SystemGit {
    fn repo_root(&self, path: &Path) -> Option<PathBuf> {
        let dir = if path.is_dir() { path } else { path.parent()? };
        let out = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .ok()?;
        if !out.status.success() {
            return None;
        }
        let stdout = String::from_utf8(out.stdout).ok()?;
        let root = stdout.trim();
        if root.is_empty() {
            None
        } else {
            Some(PathBuf::from(root))
        }
    }

    fn first_commit_time(&self, path: &Path) -> Option<DateTime<Utc>> {
        let dir = path.parent()?;
        let out = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["log", "--diff-filter=A", "--follow", "--format=%aI", "--"])
            .arg(path)
            .output()
            .ok()?;
        if !out.status.success() {
            return None;
        }
        let stdout = String::from_utf8(out.stdout).ok()?;
        // Newest first; the last line is the original add.
        let line = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last()?;
        DateTime::parse_from_rfc3339(line)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    fn mv(&self, from: &Path, to: &Path) -> bool {
        let Some(dir) = from.parent() else {
            return false;
        };
        Command::new("git")
            .arg("-C")
            .arg(dir)
            .arg("mv")
            .arg(from)
            .arg(to)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn rm(&self, path: &Path) -> bool {
        let Some(dir) = path.parent() else {
            return false;
        };
        Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["rm", "--quiet", "--force", "--"])
            .arg(path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// In-memory stand-in for tests: first-commit times are keyed by filename,
/// and `mv`/`rm` always decline so callers exercise their fs fallbacks.
#[derive(Debug, Default)]
pub struct FakeGit {
    root: Option<PathBuf>,
    added: HashMap<String, DateTime<Utc>>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        FakeGit {
            root: Some(root.into()),
            added: HashMap::new(),
        }
    }

    pub fn record_add(&mut self, filename: &str, time: DateTime<Utc>) {
        self.added.insert(filename.to_string(), time);
    }
}

impl GitOps for FakeGit {
    fn repo_root(&self, _path: &Path) -> Option<PathBuf> {
        self.root.clone()
    }

    fn first_commit_time(&self, path: &Path) -> Option<DateTime<Utc>> {
        let name = path.file_name()?.to_str()?;
        self.added.get(name).copied()
    }

    fn mv(&self, _from: &Path, _to: &Path) -> bool {
        false
    }

    fn rm(&self, _path: &Path) -> bool {
        false
    }
}
