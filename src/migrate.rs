use crate::format::{parse_issue, serialize_issue};
use crate::git::GitOps;
use crate::storage::{write_atomic, LEGACY_STATE_DIRS};
use crate::types::State;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub failed: usize,
    pub failed_files: Vec<String>,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

/// True when any legacy state subdirectory still holds `.md` files.
pub fn detect_legacy_structure(dir: &Path) -> Result<bool> {
    for name in LEGACY_STATE_DIRS {
        if !legacy_files(&dir.join(name))?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Move every issue out of the legacy per-state subdirectories into the
/// flat layout.
///
/// The directory name is the ground truth for state: front-matter that
/// disagrees is rewritten before the move. Failures are per-file; one stuck
/// file never blocks the rest. Emptied state directories are removed
/// afterwards, including a leftover `.gitkeep`. Renames and removals go
/// through git when the tree is a checkout.
pub fn migrate(dir: &Path, git: &dyn GitOps, dry_run: bool) -> Result<MigrationReport> {
    let mut report = MigrationReport {
        dry_run,
        ..Default::default()
    };

    for name in LEGACY_STATE_DIRS {
        let sub = dir.join(name);
        let Some(state) = State::from_dir_name(name) else {
            continue;
        };

        for path in legacy_files(&sub)? {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            match migrate_one(dir, &path, &state, git, dry_run) {
                Ok(()) => report.migrated += 1,
                Err(e) => {
                    report.failed += 1;
                    report.failed_files.push(filename.clone());
                    report.errors.push(format!("{}: {:#}", filename, e));
                }
            }
        }
    }

    if !dry_run {
        cleanup_state_dirs(dir, git, &mut report);
    }

    Ok(report)
}

fn migrate_one(
    base_dir: &Path,
    path: &Path,
    dir_state: &State,
    git: &dyn GitOps,
    dry_run: bool,
) -> Result<()> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read issue file: {}", path.display()))?;
    let mut issue = parse_issue(&content, path)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let filename = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Issue file has no filename: {}", path.display()))?;
    let destination = base_dir.join(filename);
    if destination.exists() {
        anyhow::bail!("Destination already exists: {}", destination.display());
    }

    if dry_run {
        return Ok(());
    }

    if issue.state != *dir_state {
        issue.state = dir_state.clone();
        if issue.state.is_closed() {
            if issue.closed_at.is_none() {
                issue.closed_at = Some(Utc::now());
            }
        } else {
            issue.closed_at = None;
        }
        issue.updated_at = Utc::now();
        write_atomic(path, &serialize_issue(&issue)?)?;
    }

    if !git.mv(path, &destination) {
        fs::rename(path, &destination).with_context(|| {
            format!(
                "Failed to move {} to {}",
                path.display(),
                destination.display()
            )
        })?;
    }

    Ok(())
}

/// Drop state directories the migration emptied. A directory holding only a
/// `.gitkeep` counts as empty; anything else stays put.
fn cleanup_state_dirs(dir: &Path, git: &dyn GitOps, report: &mut MigrationReport) {
    for name in LEGACY_STATE_DIRS {
        let sub = dir.join(name);
        if !sub.is_dir() {
            continue;
        }

        let gitkeep = sub.join(".gitkeep");
        if gitkeep.is_file() && dir_entry_count(&sub) == Some(1) {
            if !git.rm(&gitkeep) {
                if let Err(e) = fs::remove_file(&gitkeep) {
                    report
                        .errors
                        .push(format!("{}: failed to remove .gitkeep: {}", name, e));
                    continue;
                }
            }
        }

        if dir_entry_count(&sub) == Some(0) {
            if let Err(e) = fs::remove_dir(&sub) {
                report
                    .errors
                    .push(format!("{}: failed to remove directory: {}", name, e));
            }
        }
    }
}

fn dir_entry_count(dir: &Path) -> Option<usize> {
    fs::read_dir(dir).ok().map(|entries| entries.count())
}

fn legacy_files(sub: &Path) -> Result<Vec<PathBuf>> {
    if !sub.is_dir() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(sub)
        .with_context(|| format!("Failed to read state directory: {}", sub.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && entry.file_name().to_string_lossy().ends_with(".md") {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::FakeGit;
    use crate::storage::Store;
    use std::fs;
    use tempfile::TempDir;

    fn write_legacy(dir: &Path, state_dir: &str, name: &str, content: &str) {
        let sub = dir.join(state_dir);
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join(name), content).unwrap();
    }

    #[test]
    fn test_detect_legacy_structure() {
        let tmp = TempDir::new().unwrap();
        assert!(!detect_legacy_structure(tmp.path()).unwrap());

        fs::create_dir_all(tmp.path().join("open")).unwrap();
        assert!(!detect_legacy_structure(tmp.path()).unwrap());

        write_legacy(tmp.path(), "open", "001-a.md", "---\nnumber: 1\ntitle: a\n---\n");
        assert!(detect_legacy_structure(tmp.path()).unwrap());
    }

    #[test]
    fn test_migrate_preserves_directory_states() {
        let tmp = TempDir::new().unwrap();
        write_legacy(tmp.path(), "open", "001-a.md", "---\nnumber: 1\ntitle: a\n---\n");
        write_legacy(
            tmp.path(),
            "in-progress",
            "002-b.md",
            "---\nnumber: 2\ntitle: b\n---\n",
        );
        // Front-matter lies about the state; the directory wins.
        write_legacy(
            tmp.path(),
            "done",
            "003-c.md",
            "---\nnumber: 3\ntitle: c\nstate: open\n---\n",
        );

        let report = migrate(tmp.path(), &FakeGit::new(), false).unwrap();
        assert_eq!(report.migrated, 3);
        assert_eq!(report.failed, 0);

        for name in ["001-a.md", "002-b.md", "003-c.md"] {
            assert!(tmp.path().join(name).exists(), "{} missing", name);
        }
        for sub in ["open", "in-progress", "done"] {
            assert!(!tmp.path().join(sub).exists(), "{} not removed", sub);
        }

        let store = Store::open(tmp.path().to_path_buf()).unwrap();
        let (issues, failures) = store.list(&[]).unwrap();
        assert!(failures.is_empty());
        assert_eq!(issues[0].state, crate::types::State::Open);
        assert_eq!(issues[1].state, crate::types::State::Wip);
        assert_eq!(issues[2].state, crate::types::State::Done);
        // Entering a closed state through migration stamps closed_at.
        assert!(issues[2].closed_at.is_some());
    }

    #[test]
    fn test_migrate_destination_conflict_is_per_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("001-a.md"), "---\nnumber: 1\ntitle: flat\n---\n").unwrap();
        write_legacy(tmp.path(), "open", "001-a.md", "---\nnumber: 1\ntitle: legacy\n---\n");
        write_legacy(tmp.path(), "open", "002-b.md", "---\nnumber: 2\ntitle: b\n---\n");

        let report = migrate(tmp.path(), &FakeGit::new(), false).unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failed_files, vec!["001-a.md"]);
        assert!(report.errors[0].contains("already exists"));

        // The stuck file stays in place, so its directory survives cleanup.
        assert!(tmp.path().join("open").join("001-a.md").exists());
        assert!(tmp.path().join("002-b.md").exists());
    }

    #[test]
    fn test_migrate_unparseable_file_left_in_place() {
        let tmp = TempDir::new().unwrap();
        write_legacy(tmp.path(), "open", "001-bad.md", "no front matter\n");

        let report = migrate(tmp.path(), &FakeGit::new(), false).unwrap();
        assert_eq!(report.migrated, 0);
        assert_eq!(report.failed, 1);
        assert!(tmp.path().join("open").join("001-bad.md").exists());
    }

    #[test]
    fn test_migrate_removes_lone_gitkeep() {
        let tmp = TempDir::new().unwrap();
        write_legacy(tmp.path(), "closed", "004-d.md", "---\nnumber: 4\ntitle: d\n---\n");
        fs::write(tmp.path().join("closed").join(".gitkeep"), "").unwrap();

        let report = migrate(tmp.path(), &FakeGit::new(), false).unwrap();
        assert_eq!(report.migrated, 1);
        assert!(!tmp.path().join("closed").exists());
    }

    #[test]
    fn test_migrate_dry_run_touches_nothing() {
        let tmp = TempDir::new().unwrap();
        write_legacy(tmp.path(), "open", "001-a.md", "---\nnumber: 1\ntitle: a\n---\n");

        let report = migrate(tmp.path(), &FakeGit::new(), true).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.migrated, 1);
        assert!(tmp.path().join("open").join("001-a.md").exists());
        assert!(!tmp.path().join("001-a.md").exists());
    }

    #[test]
    fn test_migrate_is_idempotent_when_flat() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("001-a.md"), "---\nnumber: 1\ntitle: a\n---\n").unwrap();

        let report = migrate(tmp.path(), &FakeGit::new(), false).unwrap();
        assert_eq!(report.migrated, 0);
        assert_eq!(report.failed, 0);
        assert!(report.errors.is_empty());
    }
}
