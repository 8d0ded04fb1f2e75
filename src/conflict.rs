//! Numbering-conflict detection and repair.
//!
//! A flat issue directory can drift into three anomalies:
//! - two files sharing the same filename number prefix
//! - two parseable files sharing the same front-matter number
//! - a single file whose filename prefix and front-matter number disagree
//!
//! Repair runs in three phases: `scan_files` collects per-file facts,
//! `detect` reports `Conflict`s, `resolve` assigns each a concrete
//! `FixPlan`, and `apply` executes the plans. A dry run stops after
//! planning and prints what a real run would do.
//!
//! Duplicate losers are renumbered to fresh numbers past everything in use;
//! the surviving file is picked by earliest effective creation time (git
//! first-commit time, then front-matter `created_at`, then neither, with
//! the filename as the final tie-break). For a mismatch the filename wins:
//! it is the externally visible identity.

use crate::format::{parse_issue, scan_datetime_fields, serialize_issue, DatetimeFormat};
use crate::git::GitOps;
use crate::slug::{filename_number, filename_slug};
use crate::storage::write_atomic;
use crate::types::{State, LEGACY_STATE_ALIASES};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-file facts gathered in one pass, enough to detect and resolve every
/// conflict kind without re-reading.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub path: PathBuf,
    pub filename: String,
    /// Integer prefix per `^(\d+)-`, when present.
    pub filename_number: Option<u32>,
    /// Front-matter number; `None` when the file does not parse.
    pub front_matter_number: Option<u32>,
    /// Front-matter `created_at`, when present and non-zero.
    pub created_at: Option<DateTime<Utc>>,
    /// First-commit time from git history, when available.
    pub git_created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl FileInfo {
    /// Creation time used for elections: git history first, then
    /// front-matter. `None` ranks as newest.
    pub fn effective_created_at(&self) -> Option<DateTime<Utc>> {
        self.git_created_at.or(self.created_at)
    }

    fn election_key(&self) -> (DateTime<Utc>, String) {
        (
            self.effective_created_at()
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            self.filename.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    DuplicateFilenameNumber,
    DuplicateFrontMatterNumber,
    Mismatch,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::DuplicateFilenameNumber => "duplicate-filename-number",
            ConflictKind::DuplicateFrontMatterNumber => "duplicate-front-matter-number",
            ConflictKind::Mismatch => "filename/front-matter-mismatch",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    /// The contested number.
    pub number: u32,
    pub files: Vec<FileInfo>,
}

/// What to do to one file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixAction {
    /// Rename to a fresh number and rewrite the front-matter to match.
    Renumber {
        old_number: Option<u32>,
        new_number: u32,
        new_filename: String,
    },
    /// Rewrite the front-matter number to the filename prefix. No rename.
    RewriteNumber { old_number: u32, new_number: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct FixPlan {
    pub path: PathBuf,
    pub filename: String,
    pub kind: ConflictKind,
    /// The number the conflict was detected on.
    pub conflict_number: u32,
    pub action: FixAction,
}

impl FixPlan {
    pub fn describe(&self) -> String {
        match &self.action {
            FixAction::Renumber {
                old_number,
                new_number,
                new_filename,
            } => {
                let old = old_number
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!(
                    "{}: rename to {} (number {} -> {})",
                    self.filename, new_filename, old, new_number
                )
            }
            FixAction::RewriteNumber {
                old_number,
                new_number,
            } => format!(
                "{}: rewrite front-matter number {} -> {}",
                self.filename, old_number, new_number
            ),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RepairReport {
    pub conflicts_found: usize,
    pub plans: Vec<FixPlan>,
    pub applied: Vec<String>,
    pub failed: Vec<String>,
    pub dry_run: bool,
}

/// Collect per-file facts for every top-level `.md` entry, sorted by
/// filename. Git history is consulted only when `dir` sits in a checkout.
pub fn scan_files(dir: &Path, git: &dyn GitOps) -> Result<Vec<FileInfo>> {
    let in_repo = git.repo_root(dir).is_some();

    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read issue directory: {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().to_string();
        if !filename.ends_with(".md") {
            continue;
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read issue file: {}", path.display()))?;

        let (front_matter_number, created_at, parse_error) = match parse_issue(&content, &path) {
            Ok(issue) => (
                Some(issue.number),
                issue.has_created_at().then_some(issue.created_at),
                None,
            ),
            Err(e) => (None, None, Some(e.to_string())),
        };

        files.push(FileInfo {
            filename_number: filename_number(&filename),
            filename,
            front_matter_number,
            created_at,
            git_created_at: if in_repo {
                git.first_commit_time(&path)
            } else {
                None
            },
            parse_error,
            path,
        });
    }

    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}

/// Single read-only pass over scanned files producing every conflict.
///
/// A set of files already reported as a filename duplicate is not reported
/// again as a front-matter duplicate, and files inside either duplicate kind
/// are not additionally reported as mismatches (their fix covers both).
pub fn detect(files: &[FileInfo]) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    let mut by_filename_number: BTreeMap<u32, Vec<&FileInfo>> = BTreeMap::new();
    for file in files {
        if let Some(n) = file.filename_number {
            by_filename_number.entry(n).or_default().push(file);
        }
    }

    let mut filename_dup_paths: HashSet<&Path> = HashSet::new();
    for (number, group) in &by_filename_number {
        if group.len() < 2 {
            continue;
        }
        filename_dup_paths.extend(group.iter().map(|f| f.path.as_path()));
        conflicts.push(Conflict {
            kind: ConflictKind::DuplicateFilenameNumber,
            number: *number,
            files: group.iter().map(|f| (*f).clone()).collect(),
        });
    }

    let mut by_front_matter_number: BTreeMap<u32, Vec<&FileInfo>> = BTreeMap::new();
    for file in files {
        if filename_dup_paths.contains(file.path.as_path()) {
            continue;
        }
        if let Some(n) = file.front_matter_number {
            by_front_matter_number.entry(n).or_default().push(file);
        }
    }

    let mut front_matter_dup_paths: HashSet<&Path> = HashSet::new();
    for (number, group) in &by_front_matter_number {
        if group.len() < 2 {
            continue;
        }
        front_matter_dup_paths.extend(group.iter().map(|f| f.path.as_path()));
        conflicts.push(Conflict {
            kind: ConflictKind::DuplicateFrontMatterNumber,
            number: *number,
            files: group.iter().map(|f| (*f).clone()).collect(),
        });
    }

    for file in files {
        if filename_dup_paths.contains(file.path.as_path())
            || front_matter_dup_paths.contains(file.path.as_path())
        {
            continue;
        }
        if let (Some(fname), Some(fm)) = (file.filename_number, file.front_matter_number) {
            if fname != fm {
                conflicts.push(Conflict {
                    kind: ConflictKind::Mismatch,
                    number: fname,
                    files: vec![file.clone()],
                });
            }
        }
    }

    conflicts
}

/// Turn conflicts into concrete fix plans.
///
/// Fresh numbers start past the maximum of every number in use anywhere,
/// filename or front-matter, so renumbering can never collide with a live
/// number; allocation saturates at `u32::MAX` instead of wrapping. Duplicate
/// groups keep their earliest file; if that survivor's own front-matter
/// disagrees with its filename, a rewrite is planned for it too, so one
/// repair pass leaves the tree conflict-free.
pub fn resolve(conflicts: &[Conflict], files: &[FileInfo]) -> Vec<FixPlan> {
    let mut next = files
        .iter()
        .flat_map(|f| [f.filename_number, f.front_matter_number])
        .flatten()
        .max()
        .unwrap_or(0)
        .saturating_add(1);

    let mut plans = Vec::new();

    for conflict in conflicts {
        match conflict.kind {
            ConflictKind::DuplicateFilenameNumber | ConflictKind::DuplicateFrontMatterNumber => {
                let mut group = conflict.files.clone();
                group.sort_by_key(|f| f.election_key());

                let winner = &group[0];
                if let (Some(fname), Some(fm)) = (winner.filename_number, winner.front_matter_number)
                {
                    if fname != fm {
                        plans.push(FixPlan {
                            path: winner.path.clone(),
                            filename: winner.filename.clone(),
                            kind: conflict.kind,
                            conflict_number: conflict.number,
                            action: FixAction::RewriteNumber {
                                old_number: fm,
                                new_number: fname,
                            },
                        });
                    }
                }

                for loser in &group[1..] {
                    let new_filename = format!("{:03}-{}.md", next, filename_slug(&loser.filename));
                    plans.push(FixPlan {
                        path: loser.path.clone(),
                        filename: loser.filename.clone(),
                        kind: conflict.kind,
                        conflict_number: conflict.number,
                        action: FixAction::Renumber {
                            old_number: loser.front_matter_number,
                            new_number: next,
                            new_filename,
                        },
                    });
                    next = next.saturating_add(1);
                }
            }
            ConflictKind::Mismatch => {
                let file = &conflict.files[0];
                if let (Some(fname), Some(fm)) = (file.filename_number, file.front_matter_number) {
                    plans.push(FixPlan {
                        path: file.path.clone(),
                        filename: file.filename.clone(),
                        kind: ConflictKind::Mismatch,
                        conflict_number: conflict.number,
                        action: FixAction::RewriteNumber {
                            old_number: fm,
                            new_number: fname,
                        },
                    });
                }
            }
        }
    }

    plans
}

/// Execute fix plans. Per-plan failures never abort the pass; they are
/// recorded and the next plan runs. Every touched file gets a `<name>.backup`
/// sidecar first.
pub fn apply(plans: Vec<FixPlan>, git: &dyn GitOps, dry_run: bool) -> Result<RepairReport> {
    let mut report = RepairReport {
        dry_run,
        ..Default::default()
    };

    let now = Utc::now();
    for plan in &plans {
        if dry_run {
            report.applied.push(plan.describe());
            continue;
        }
        match apply_one(plan, git, now) {
            Ok(()) => report.applied.push(plan.describe()),
            Err(e) => report.failed.push(format!("{}: {:#}", plan.filename, e)),
        }
    }

    report.plans = plans;
    Ok(report)
}

fn apply_one(plan: &FixPlan, git: &dyn GitOps, now: DateTime<Utc>) -> Result<()> {
    match &plan.action {
        FixAction::Renumber {
            new_number,
            new_filename,
            ..
        } => {
            let dir = plan
                .path
                .parent()
                .ok_or_else(|| anyhow::anyhow!("No parent directory for {}", plan.path.display()))?;
            let target = dir.join(new_filename);
            if target.exists() {
                anyhow::bail!("Target file already exists: {}", new_filename);
            }

            write_backup(&plan.path)?;

            let content = fs::read_to_string(&plan.path)
                .with_context(|| format!("Failed to read {}", plan.path.display()))?;
            // An unparseable duplicate still gets renamed out of the way;
            // its front-matter stays broken and keeps showing in warnings.
            if let Ok(mut issue) = parse_issue(&content, &plan.path) {
                issue.number = *new_number;
                issue.updated_at = now;
                write_atomic(&plan.path, &serialize_issue(&issue)?)?;
            }

            if !git.mv(&plan.path, &target) {
                fs::rename(&plan.path, &target).with_context(|| {
                    format!(
                        "Failed to rename {} to {}",
                        plan.path.display(),
                        target.display()
                    )
                })?;
            }
            Ok(())
        }
        FixAction::RewriteNumber { new_number, .. } => {
            write_backup(&plan.path)?;

            let content = fs::read_to_string(&plan.path)
                .with_context(|| format!("Failed to read {}", plan.path.display()))?;
            let mut issue = parse_issue(&content, &plan.path)
                .with_context(|| format!("Failed to parse {}", plan.path.display()))?;
            issue.number = *new_number;
            issue.updated_at = now;
            write_atomic(&plan.path, &serialize_issue(&issue)?)
        }
    }
}

fn write_backup(path: &Path) -> Result<()> {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".backup");
    fs::copy(path, Path::new(&backup))
        .with_context(|| format!("Failed to write backup for {}", path.display()))?;
    Ok(())
}

/// One-call repair: scan, detect, resolve, apply.
pub fn repair(dir: &Path, git: &dyn GitOps, dry_run: bool) -> Result<RepairReport> {
    let files = scan_files(dir, git)?;
    let conflicts = detect(&files);
    let plans = resolve(&conflicts, &files);
    let mut report = apply(plans, git, dry_run)?;
    report.conflicts_found = conflicts.len();
    Ok(report)
}

#[derive(Debug, Default, Serialize)]
pub struct NormalizeReport {
    pub examined: usize,
    pub rewritten: Vec<String>,
    pub flagged: Vec<String>,
    pub dry_run: bool,
}

/// Rewrite legacy datetime representations to canonical RFC3339 `Z` form.
///
/// A file is rewritten when any datetime key carries a recognized legacy
/// format or uses an alias key (`created`, `updated`). Files holding an
/// unrecognizable datetime are only flagged: rewriting would replace the
/// value with the zero time and lose whatever the author meant.
pub fn normalize_datetimes(dir: &Path, dry_run: bool) -> Result<NormalizeReport> {
    let mut report = NormalizeReport {
        dry_run,
        ..Default::default()
    };

    for (path, filename, content) in markdown_files(dir)? {
        report.examined += 1;

        let fields = match scan_datetime_fields(&content) {
            Ok(fields) => fields,
            Err(e) => {
                report.flagged.push(format!("{}: {}", filename, e));
                continue;
            }
        };

        let unknown: Vec<&(String, String, DatetimeFormat)> = fields
            .iter()
            .filter(|(_, _, f)| *f == DatetimeFormat::Unknown)
            .collect();
        for (key, raw, _) in &unknown {
            report
                .flagged
                .push(format!("{}: {} has unrecognized datetime {:?}", filename, key, raw));
        }
        if !unknown.is_empty() {
            continue;
        }

        let legacy: Vec<String> = fields
            .iter()
            .filter(|(key, _, format)| {
                !format.is_canonical() || key == "created" || key == "updated"
            })
            .map(|(key, _, format)| format!("{} ({})", key, format))
            .collect();
        if legacy.is_empty() {
            continue;
        }

        report
            .rewritten
            .push(format!("{}: {}", filename, legacy.join(", ")));
        if dry_run {
            continue;
        }

        let issue = parse_issue(&content, &path)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        write_atomic(&path, &serialize_issue(&issue)?)?;
    }

    Ok(report)
}

/// Rewrite deprecated state spellings (`in-progress`, `check`, `review`) to
/// their canonical equivalents. States outside the alias table are flagged
/// and left alone.
pub fn normalize_states(dir: &Path, dry_run: bool) -> Result<NormalizeReport> {
    let mut report = NormalizeReport {
        dry_run,
        ..Default::default()
    };

    for (path, filename, content) in markdown_files(dir)? {
        report.examined += 1;

        let Ok(mut issue) = parse_issue(&content, &path) else {
            continue;
        };
        let State::Unknown(found) = issue.state.clone() else {
            continue;
        };

        let Some((_, canonical)) = LEGACY_STATE_ALIASES.iter().find(|(alias, _)| *alias == found)
        else {
            report
                .flagged
                .push(format!("{}: unknown state {:?}", filename, found));
            continue;
        };

        report
            .rewritten
            .push(format!("{}: state {} -> {}", filename, found, canonical));
        if dry_run {
            continue;
        }

        issue.state = canonical.clone();
        if !issue.state.is_closed() {
            issue.closed_at = None;
        }
        write_atomic(&path, &serialize_issue(&issue)?)?;
    }

    Ok(report)
}

fn markdown_files(dir: &Path) -> Result<Vec<(PathBuf, String, String)>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read issue directory: {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().to_string();
        if !filename.ends_with(".md") {
            continue;
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read issue file: {}", path.display()))?;
        files.push((path, filename, content));
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}
