use crate::format::{parse_issue, serialize_issue};
use crate::slug::{filename_number, issue_filename};
use crate::types::{Issue, ParseFailure, State, Stats};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Subdirectory names recognized in the legacy layout, in read order.
/// `in-progress` is the historical spelling of `wip`.
pub const LEGACY_STATE_DIRS: &[&str] = &["open", "wip", "in-progress", "done", "closed"];

pub struct Store {
    dir: PathBuf,
    warnings: Mutex<Vec<ParseFailure>>,
}

impl Store {
    /// Open an existing issue directory.
    pub fn open(dir: PathBuf) -> Result<Self> {
        if !dir.is_dir() {
            anyhow::bail!("Issue directory not found: {}", dir.display());
        }
        Ok(Self {
            dir,
            warnings: Mutex::new(Vec::new()),
        })
    }

    /// Create the issue directory (and its .gitignore) if needed.
    pub fn init(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create issue directory: {}", dir.display()))?;
        ensure_gitignore(&dir)?;
        Ok(Self {
            dir,
            warnings: Mutex::new(Vec::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// List issues, filtered to `states` (empty = all), sorted by number.
    ///
    /// Flat mode wins whenever at least one top-level file parses; only then
    /// is state taken from front-matter. Otherwise the per-state legacy
    /// subdirectories are read and the directory name overrides whatever the
    /// front-matter claims. Files that fail to parse never abort the listing;
    /// they accumulate as warnings.
    pub fn list(&self, states: &[State]) -> Result<(Vec<Issue>, Vec<ParseFailure>)> {
        let mut issues = Vec::new();
        let mut failures = Vec::new();

        self.scan_dir(&self.dir, None, &mut issues, &mut failures)?;

        if issues.is_empty() {
            for name in LEGACY_STATE_DIRS {
                let sub = self.dir.join(name);
                if !sub.is_dir() {
                    continue;
                }
                let Some(state) = State::from_dir_name(name) else {
                    continue;
                };
                self.scan_dir(&sub, Some(&state), &mut issues, &mut failures)?;
            }
        }

        issues.sort_by_key(|i| i.number);

        *self
            .warnings
            .lock()
            .expect("warnings mutex should not be poisoned") = failures.clone();

        let issues = if states.is_empty() {
            issues
        } else {
            issues
                .into_iter()
                .filter(|i| states.contains(&i.state))
                .collect()
        };

        Ok((issues, failures))
    }

    fn scan_dir(
        &self,
        dir: &Path,
        dir_state: Option<&State>,
        issues: &mut Vec<Issue>,
        failures: &mut Vec<ParseFailure>,
    ) -> Result<()> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("Failed to read issue directory: {}", dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if !name_str.ends_with(".md") {
                continue;
            }

            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read issue file: {}", path.display()))?;

            match parse_issue(&content, &path) {
                Ok(mut issue) => {
                    if let Some(state) = dir_state {
                        issue.state = state.clone();
                    }
                    issues.push(issue);
                }
                Err(e) => failures.push(ParseFailure {
                    path: path.clone(),
                    filename: name_str.to_string(),
                    error: e.to_string(),
                    state: dir_state.map(|s| s.to_string()).unwrap_or_default(),
                    content: None,
                }),
            }
        }

        Ok(())
    }

    /// Get one issue by number.
    pub fn get(&self, number: u32) -> Result<Issue> {
        let (issues, _) = self.list(&[])?;
        issues
            .into_iter()
            .find(|i| i.number == number)
            .ok_or_else(|| anyhow::anyhow!("issue #{} not found", number))
    }

    /// Create a new issue file in the flat layout.
    pub fn create(
        &self,
        title: &str,
        labels: Vec<String>,
        assignees: Vec<String>,
        body: String,
    ) -> Result<Issue> {
        let number = self.next_number()?;
        let mut issue = Issue::new(number, title.to_string());
        issue.labels = labels;
        issue.assignees = assignees;
        issue.body = body;

        let path = self.dir.join(issue_filename(number, title));
        if path.exists() {
            anyhow::bail!("Refusing to overwrite existing file: {}", path.display());
        }
        issue.file_path = path.clone();

        let markdown = serialize_issue(&issue)?;
        write_atomic(&path, &markdown)?;

        Ok(issue)
    }

    /// Highest number anywhere plus one, saturating at `u32::MAX`. Both
    /// filename prefixes and front-matter numbers count, so a repair in
    /// flight cannot be undercut.
    fn next_number(&self) -> Result<u32> {
        let (issues, failures) = self.list(&[])?;

        let mut max = 0;
        for issue in &issues {
            max = max.max(issue.number);
            if let Some(n) = issue
                .file_path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(filename_number)
            {
                max = max.max(n);
            }
        }
        for failure in &failures {
            if let Some(n) = filename_number(&failure.filename) {
                max = max.max(n);
            }
        }

        Ok(max.saturating_add(1))
    }

    /// Set a new state on an issue and rewrite its file in place.
    ///
    /// `closed_at` appears exactly when the issue sits in done or closed: it
    /// is stamped on the transition in, kept across done <-> closed, and
    /// cleared on the way out.
    pub fn update_state(&self, issue: &mut Issue, new_state: State) -> Result<()> {
        let now = Utc::now();

        if new_state.is_closed() {
            if issue.closed_at.is_none() || !issue.state.is_closed() {
                issue.closed_at = Some(now);
            }
        } else {
            issue.closed_at = None;
        }
        issue.state = new_state;
        issue.updated_at = now;

        let markdown = serialize_issue(issue)?;
        write_atomic(&issue.file_path, &markdown)
    }

    /// Move an issue to a new state.
    ///
    /// The front-matter is rewritten in both layouts; the legacy layout
    /// additionally renames the file into the matching state subdirectory.
    /// No-op when the state already matches.
    pub fn move_state(&self, number: u32, new_state: State) -> Result<Issue> {
        let mut issue = self.get(number)?;
        if issue.state == new_state {
            return Ok(issue);
        }

        let flat = issue.file_path.parent() == Some(self.dir.as_path());
        if flat {
            self.update_state(&mut issue, new_state)?;
            return Ok(issue);
        }

        let target_dir = self.dir.join(new_state.as_str());
        fs::create_dir_all(&target_dir)
            .with_context(|| format!("Failed to create state directory: {}", target_dir.display()))?;

        let filename = issue
            .file_path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Issue file has no filename: {}", issue.file_path.display()))?;
        let target = target_dir.join(filename);
        if target.exists() {
            anyhow::bail!("Target file already exists: {}", target.display());
        }

        // Restamp first so the file landing in the new directory already
        // carries the matching state and closed_at.
        self.update_state(&mut issue, new_state)?;

        fs::rename(&issue.file_path, &target).with_context(|| {
            format!(
                "Failed to move {} to {}",
                issue.file_path.display(),
                target.display()
            )
        })?;

        issue.file_path = target;
        Ok(issue)
    }

    /// Case-insensitive substring search over titles (and bodies unless
    /// `title_only`).
    pub fn search(&self, keyword: &str, title_only: bool) -> Result<Vec<Issue>> {
        let (issues, _) = self.list(&[])?;
        let needle = keyword.to_lowercase();
        Ok(issues
            .into_iter()
            .filter(|i| {
                i.title.to_lowercase().contains(&needle)
                    || (!title_only && i.body.to_lowercase().contains(&needle))
            })
            .collect())
    }

    /// Issues carrying `label` (case-insensitive exact match).
    pub fn filter_by_label(&self, label: &str, states: &[State]) -> Result<Vec<Issue>> {
        let (issues, _) = self.list(states)?;
        let wanted = label.to_lowercase();
        Ok(issues
            .into_iter()
            .filter(|i| i.labels.iter().any(|l| l.to_lowercase() == wanted))
            .collect())
    }

    /// Issues assigned to `assignee` (case-insensitive exact match).
    pub fn filter_by_assignee(&self, assignee: &str, states: &[State]) -> Result<Vec<Issue>> {
        let (issues, _) = self.list(states)?;
        let wanted = assignee.to_lowercase();
        Ok(issues
            .into_iter()
            .filter(|i| i.assignees.iter().any(|a| a.to_lowercase() == wanted))
            .collect())
    }

    /// Aggregate counts across the whole store.
    pub fn stats(&self) -> Result<Stats> {
        let (issues, _) = self.list(&[])?;

        let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_label: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_assignee: BTreeMap<String, usize> = BTreeMap::new();

        for issue in &issues {
            *by_state.entry(issue.state.to_string()).or_insert(0) += 1;
            for label in &issue.labels {
                *by_label.entry(label.clone()).or_insert(0) += 1;
            }
            for assignee in &issue.assignees {
                *by_assignee.entry(assignee.clone()).or_insert(0) += 1;
            }
        }

        Ok(Stats {
            total_issues: issues.len(),
            active_issues: issues.iter().filter(|i| i.is_active()).count(),
            closed_last_week: issues.iter().filter(|i| i.closed_within(7)).count(),
            by_state,
            by_label,
            by_assignee,
        })
    }

    /// Parse failures captured by the most recent `list`.
    pub fn warnings(&self) -> Vec<ParseFailure> {
        self.warnings
            .lock()
            .expect("warnings mutex should not be poisoned")
            .clone()
    }

    /// Warnings plus the raw contents of each failing file.
    pub fn warnings_with_content(&self) -> Vec<ParseFailure> {
        self.warnings()
            .into_iter()
            .map(|mut failure| {
                failure.content = fs::read_to_string(&failure.path).ok();
                failure
            })
            .collect()
    }

    /// Locate a warning by the numeric prefix of its filename. Both padded
    /// and unpadded prefixes match.
    pub fn get_failure_by_number(&self, number: u32) -> Option<ParseFailure> {
        self.warnings()
            .into_iter()
            .find(|f| filename_number(&f.filename) == Some(number))
    }
}

/// Write `content` to `path` via a temp file in the same directory, then an
/// atomic rename. On failure the original file is untouched.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("No parent directory for {}", path.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(content.as_bytes())
        .context("Failed to write temp file")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    Ok(())
}

/// Ensure .gitignore exists and contains required entries
pub(crate) fn ensure_gitignore(dir: &Path) -> Result<()> {
    use std::io::{BufRead, BufReader};

    let gitignore_path = dir.join(".gitignore");
    let required_entries = ["command_history.log", "*.backup"];

    let mut existing_lines = Vec::new();
    if gitignore_path.exists() {
        let file = fs::File::open(&gitignore_path).context("Failed to read .gitignore")?;
        let reader = BufReader::new(file);
        for line in reader.lines() {
            existing_lines.push(line?);
        }
    }

    let mut missing_entries = Vec::new();
    for entry in &required_entries {
        if !existing_lines.iter().any(|line| line.trim() == *entry) {
            missing_entries.push(*entry);
        }
    }

    if !missing_entries.is_empty() {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&gitignore_path)
            .context("Failed to open .gitignore for writing")?;

        if !existing_lines.is_empty() && !existing_lines.last().is_some_and(|l| l.is_empty()) {
            writeln!(file)?;
        }

        for entry in missing_entries {
            writeln!(file, "{}", entry)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> Store {
        Store::init(tmp.path().to_path_buf()).unwrap()
    }

    fn write_file(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_create_and_get() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let issue = store
            .create("feat: add login", vec!["auth".to_string()], vec![], "Body".to_string())
            .unwrap();
        assert_eq!(issue.number, 1);
        assert!(tmp.path().join("001-add-login.md").exists());

        let loaded = store.get(1).unwrap();
        assert_eq!(loaded.title, "feat: add login");
        assert_eq!(loaded.state, State::Open);
        assert_eq!(loaded.labels, vec!["auth"]);

        let err = store.get(99).unwrap_err();
        assert!(err.to_string().contains("issue #99 not found"));
    }

    #[test]
    fn test_next_number_counts_filename_and_front_matter() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        // Filename says 2, front-matter says 9. Both count toward the max.
        write_file(
            tmp.path(),
            "002-misnumbered.md",
            "---\nnumber: 9\ntitle: t\n---\n",
        );
        let issue = store.create("next", vec![], vec![], String::new()).unwrap();
        assert_eq!(issue.number, 10);
    }

    #[test]
    fn test_next_number_counts_unparseable_files() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        write_file(tmp.path(), "007-broken.md", "no front matter here\n");
        let issue = store.create("next", vec![], vec![], String::new()).unwrap();
        assert_eq!(issue.number, 8);
    }

    #[test]
    fn test_next_number_saturates_at_max() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        // A filename claiming u32::MAX saturates instead of wrapping to zero.
        write_file(
            tmp.path(),
            "4294967295-huge.md",
            "---\nnumber: 4294967295\ntitle: huge\n---\n",
        );
        let issue = store.create("next", vec![], vec![], String::new()).unwrap();
        assert_eq!(issue.number, u32::MAX);
    }

    #[test]
    fn test_list_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        write_file(tmp.path(), "002-b.md", "---\nnumber: 2\ntitle: b\nstate: done\n---\n");
        write_file(tmp.path(), "001-a.md", "---\nnumber: 1\ntitle: a\n---\n");
        write_file(tmp.path(), "003-c.md", "---\nnumber: 3\ntitle: c\nstate: wip\n---\n");

        let (all, failures) = store.list(&[]).unwrap();
        assert!(failures.is_empty());
        assert_eq!(
            all.iter().map(|i| i.number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let (active, _) = store.list(&[State::Open, State::Wip]).unwrap();
        assert_eq!(
            active.iter().map(|i| i.number).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn test_list_accumulates_warnings() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        write_file(tmp.path(), "001-good.md", "---\nnumber: 1\ntitle: ok\n---\n");
        write_file(tmp.path(), "002-bad.md", "just text\n");
        write_file(tmp.path(), "003-worse.md", "---\nnumber: [\n");

        let (issues, failures) = store.list(&[]).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(failures.len(), 2);

        assert_eq!(store.warnings().len(), 2);
        let failure = store.get_failure_by_number(2).unwrap();
        assert!(failure.error.contains("missing opening"));
        assert!(failure.state.is_empty());

        let with_content = store.warnings_with_content();
        assert!(with_content
            .iter()
            .any(|f| f.content.as_deref() == Some("just text\n")));
    }

    #[test]
    fn test_legacy_layout_state_from_directory() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        fs::create_dir_all(tmp.path().join("open")).unwrap();
        fs::create_dir_all(tmp.path().join("in-progress")).unwrap();
        fs::create_dir_all(tmp.path().join("done")).unwrap();

        // Front-matter state lies; the directory is authoritative.
        write_file(
            &tmp.path().join("open"),
            "001-a.md",
            "---\nnumber: 1\ntitle: a\nstate: closed\n---\n",
        );
        write_file(
            &tmp.path().join("in-progress"),
            "002-b.md",
            "---\nnumber: 2\ntitle: b\n---\n",
        );
        write_file(
            &tmp.path().join("done"),
            "003-c.md",
            "---\nnumber: 3\ntitle: c\n---\n",
        );

        let (issues, _) = store.list(&[]).unwrap();
        assert_eq!(issues.len(), 3);
        assert_eq!(issues[0].state, State::Open);
        assert_eq!(issues[1].state, State::Wip);
        assert_eq!(issues[2].state, State::Done);
    }

    #[test]
    fn test_flat_wins_over_legacy() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        write_file(tmp.path(), "001-flat.md", "---\nnumber: 1\ntitle: flat\n---\n");
        fs::create_dir_all(tmp.path().join("open")).unwrap();
        write_file(
            &tmp.path().join("open"),
            "002-legacy.md",
            "---\nnumber: 2\ntitle: legacy\n---\n",
        );

        let (issues, _) = store.list(&[]).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].number, 1);
    }

    #[test]
    fn test_update_state_closed_at_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let mut issue = store.create("t", vec![], vec![], String::new()).unwrap();
        assert!(issue.closed_at.is_none());

        store.update_state(&mut issue, State::Done).unwrap();
        let closed_at = issue.closed_at;
        assert!(closed_at.is_some());

        // done -> closed keeps the original close time.
        store.update_state(&mut issue, State::Closed).unwrap();
        assert_eq!(issue.closed_at, closed_at);

        store.update_state(&mut issue, State::Open).unwrap();
        assert!(issue.closed_at.is_none());

        // Changes are visible through a fresh read.
        let reloaded = store.get(issue.number).unwrap();
        assert_eq!(reloaded.state, State::Open);
        assert!(reloaded.closed_at.is_none());
    }

    #[test]
    fn test_move_state_flat_rewrites_in_place() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let issue = store.create("t", vec![], vec![], String::new()).unwrap();
        let moved = store.move_state(issue.number, State::Wip).unwrap();
        assert_eq!(moved.state, State::Wip);
        assert_eq!(moved.file_path, issue.file_path);

        // No-op when the state already matches: nothing is rewritten.
        let reloaded = store.get(issue.number).unwrap();
        let again = store.move_state(issue.number, State::Wip).unwrap();
        assert_eq!(again.updated_at, reloaded.updated_at);
    }

    #[test]
    fn test_move_state_legacy_renames() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        fs::create_dir_all(tmp.path().join("open")).unwrap();
        write_file(
            &tmp.path().join("open"),
            "001-a.md",
            "---\nnumber: 1\ntitle: a\n---\n",
        );

        let moved = store.move_state(1, State::Done).unwrap();
        assert_eq!(moved.file_path, tmp.path().join("done").join("001-a.md"));
        assert!(!tmp.path().join("open").join("001-a.md").exists());
        assert!(tmp.path().join("done").join("001-a.md").exists());
    }

    #[test]
    fn test_move_state_legacy_rewrites_front_matter() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        fs::create_dir_all(tmp.path().join("open")).unwrap();
        write_file(
            &tmp.path().join("open"),
            "001-a.md",
            "---\nnumber: 1\ntitle: a\nstate: open\n---\n",
        );

        let before = store.get(1).unwrap();
        let moved = store.move_state(1, State::Done).unwrap();
        assert!(moved.closed_at.is_some());
        assert!(moved.updated_at > before.updated_at);

        // The moved file carries the new state, not just the new directory.
        let content = fs::read_to_string(tmp.path().join("done").join("001-a.md")).unwrap();
        assert!(content.contains("state: done"));
        assert!(content.contains("closed_at:"));

        let (issues, _) = store.list(&[]).unwrap();
        assert_eq!(issues[0].state, State::Done);
        assert!(issues[0].closed_at.is_some());

        // Leaving done clears closed_at on disk as well.
        store.move_state(1, State::Open).unwrap();
        let content = fs::read_to_string(tmp.path().join("open").join("001-a.md")).unwrap();
        assert!(content.contains("state: open"));
        assert!(!content.contains("closed_at:"));
    }

    #[test]
    fn test_search_and_filters() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        store
            .create(
                "Login crash",
                vec!["Bug".to_string()],
                vec!["hana".to_string()],
                "stack trace mentions timeout".to_string(),
            )
            .unwrap();
        store
            .create("Docs pass", vec![], vec![], "rewrite the intro".to_string())
            .unwrap();

        assert_eq!(store.search("LOGIN", false).unwrap().len(), 1);
        assert_eq!(store.search("timeout", false).unwrap().len(), 1);
        assert_eq!(store.search("timeout", true).unwrap().len(), 0);

        assert_eq!(store.filter_by_label("bug", &[]).unwrap().len(), 1);
        assert_eq!(store.filter_by_assignee("HANA", &[]).unwrap().len(), 1);
        assert_eq!(store.filter_by_label("missing", &[]).unwrap().len(), 0);
    }

    #[test]
    fn test_stats() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let mut a = store
            .create("a", vec!["ui".to_string()], vec![], String::new())
            .unwrap();
        store
            .create("b", vec!["ui".to_string(), "bug".to_string()], vec![], String::new())
            .unwrap();
        store.update_state(&mut a, State::Done).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_issues, 2);
        assert_eq!(stats.active_issues, 1);
        assert_eq!(stats.closed_last_week, 1);
        assert_eq!(stats.by_state.get("done"), Some(&1));
        assert_eq!(stats.by_state.get("open"), Some(&1));
        assert_eq!(stats.by_label.get("ui"), Some(&2));
    }

    #[test]
    fn test_ensure_gitignore_appends_once() {
        let tmp = TempDir::new().unwrap();
        let _ = store(&tmp);

        let gitignore = tmp.path().join(".gitignore");
        let first = fs::read_to_string(&gitignore).unwrap();
        assert!(first.contains("command_history.log"));
        assert!(first.contains("*.backup"));

        ensure_gitignore(tmp.path()).unwrap();
        let second = fs::read_to_string(&gitignore).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("001-a.md");

        write_atomic(&path, "first").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");
        write_atomic(&path, "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }
}
