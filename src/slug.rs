use regex::Regex;
use std::sync::LazyLock;

/// Slugs longer than this get cut back to the last hyphen boundary.
const SLUG_SOFT_LIMIT: usize = 30;
/// Absolute cap for slugs with no hyphen to cut at.
const SLUG_HARD_LIMIT: usize = 50;

static COMMIT_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)(feat|fix|docs|chore|refactor|test|style|perf|ci|build)(\([^)]*\))?!?:\s*")
        .unwrap()
});

/// Valid filename slugs: lowercase ASCII, digits, hyphens, Unicode letters.
pub static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9\-\p{L}]+$").unwrap());

/// Turn a title into a filename slug.
///
/// Strips one leading conventional-commit prefix (`feat:`, `fix(scope):`, ...),
/// lowercases, collapses every run of non-letter/digit characters into a
/// single hyphen, and truncates long results. Empty titles become `issue`.
pub fn slugify(title: &str) -> String {
    let stripped = COMMIT_PREFIX_RE.replace(title.trim(), "");

    let mut slug = String::new();
    let mut pending_hyphen = false;
    for c in stripped.chars() {
        if c.is_alphabetic() || c.is_ascii_digit() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            for lower in c.to_lowercase() {
                slug.push(lower);
            }
        } else {
            pending_hyphen = true;
        }
    }

    let slug = truncate_slug(&slug);
    if slug.is_empty() {
        "issue".to_string()
    } else {
        slug
    }
}

fn truncate_slug(slug: &str) -> String {
    let chars: Vec<char> = slug.chars().collect();
    if chars.len() <= SLUG_SOFT_LIMIT {
        return slug.to_string();
    }

    // Prefer cutting at a hyphen so words stay whole.
    let cut = chars
        .iter()
        .take(SLUG_SOFT_LIMIT + 1)
        .enumerate()
        .filter(|(_, c)| **c == '-')
        .map(|(i, _)| i)
        .next_back();

    match cut {
        Some(i) => chars[..i].iter().collect(),
        None => chars[..chars.len().min(SLUG_HARD_LIMIT)]
            .iter()
            .collect::<String>()
            .trim_end_matches('-')
            .to_string(),
    }
}

/// Canonical filename for an issue: `NNN-slug.md`, number zero-padded to 3.
pub fn issue_filename(number: u32, title: &str) -> String {
    format!("{:03}-{}.md", number, slugify(title))
}

/// Integer prefix of a filename per `^(\d+)-`. Files without one are
/// excluded from number bookkeeping.
pub fn filename_number(name: &str) -> Option<u32> {
    let (prefix, _) = name.split_once('-')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok()
}

/// Slug part of a filename: everything after the first hyphen, minus `.md`.
/// Defaults to `issue` when there is nothing usable.
pub fn filename_slug(name: &str) -> &str {
    let stem = name.strip_suffix(".md").unwrap_or(name);
    match stem.split_once('-') {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => "issue",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Add login page"), "add-login-page");
        assert_eq!(slugify("  Hello,   world!!!  "), "hello-world");
        assert_eq!(slugify("v2.0 release"), "v2-0-release");
    }

    #[test]
    fn test_slugify_strips_commit_prefixes() {
        assert_eq!(slugify("feat: add login page"), "add-login-page");
        assert_eq!(slugify("Fix(ui): crash on resize"), "crash-on-resize");
        assert_eq!(slugify("feat(api)!: breaking change"), "breaking-change");
        assert_eq!(slugify("docs:intro"), "intro");
        // Only a leading prefix is stripped.
        assert_eq!(slugify("update feat: parser"), "update-feat-parser");
        // `feature:` is not a conventional-commit type.
        assert_eq!(slugify("feature: x"), "feature-x");
    }

    #[test]
    fn test_slugify_unicode_letters_survive() {
        assert_eq!(slugify("축제 일정 페이지"), "축제-일정-페이지");
        assert_eq!(slugify("Café menü"), "café-menü");
        assert!(SLUG_RE.is_match(&slugify("축제 일정 페이지")));
    }

    #[test]
    fn test_slugify_empty_falls_back() {
        assert_eq!(slugify(""), "issue");
        assert_eq!(slugify("###"), "issue");
        assert_eq!(slugify("feat:"), "issue");
    }

    #[test]
    fn test_slugify_truncates_at_hyphen_boundary() {
        let slug = slugify("alpha bravo charlie delta echo foxtrot golf");
        assert!(slug.chars().count() <= SLUG_SOFT_LIMIT);
        assert!(!slug.ends_with('-'));
        assert_eq!(slug, "alpha-bravo-charlie-delta-echo");

        let unbroken = slugify(&"x".repeat(80));
        assert_eq!(unbroken.chars().count(), SLUG_HARD_LIMIT);
    }

    #[test]
    fn test_issue_filename_zero_padded() {
        assert_eq!(issue_filename(7, "feat: add login"), "007-add-login.md");
        assert_eq!(issue_filename(42, "x"), "042-x.md");
        assert_eq!(issue_filename(1234, "x"), "1234-x.md");
    }

    #[test]
    fn test_filename_number() {
        assert_eq!(filename_number("001-first.md"), Some(1));
        assert_eq!(filename_number("012-x.md"), Some(12));
        assert_eq!(filename_number("5-x.md"), Some(5));
        assert_eq!(filename_number("0-zero.md"), Some(0));
        assert_eq!(filename_number("notes.md"), None);
        assert_eq!(filename_number("-dash.md"), None);
        assert_eq!(filename_number("1x-y.md"), None);
    }

    #[test]
    fn test_filename_slug() {
        assert_eq!(filename_slug("001-fix-login.md"), "fix-login");
        assert_eq!(filename_slug("001-.md"), "issue");
        assert_eq!(filename_slug("001.md"), "issue");
        assert_eq!(filename_slug("7-축제.md"), "축제");
    }
}
