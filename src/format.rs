use crate::types::{zero_time, Issue, State};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Why a file could not be split or decoded.
///
/// These stay typed (instead of `anyhow`) because enumeration downgrades
/// them into `ParseFailure` warnings and the repair tooling tells the
/// variants apart.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("empty file")]
    Empty,
    #[error("missing opening '---' delimiter")]
    MissingOpeningDelimiter,
    #[error("missing closing '---' delimiter")]
    MissingClosingDelimiter,
    #[error("invalid front-matter YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Front-matter as it appears on disk, before leniency is resolved.
///
/// `created`/`updated` are accepted as aliases of the `_at` fields; they are
/// separate members (not serde aliases) so a file carrying both keys decodes
/// instead of erroring, with the `_at` variant winning.
#[derive(Debug, Deserialize)]
struct RawFrontmatter {
    number: u32,
    title: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    assignees: Vec<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    closed_at: Option<String>,
}

/// Canonical on-disk front-matter. Field order here is the serialized order.
#[derive(Serialize)]
struct CanonicalFrontmatter<'a> {
    number: u32,
    title: &'a str,
    state: &'a str,
    labels: &'a [String],
    assignees: &'a [String],
    created_at: String,
    updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    closed_at: Option<String>,
}

/// Split a file into its front-matter YAML and body.
///
/// The first non-empty line must be exactly `---`; the front-matter runs to
/// the next `---` line; the rest is the body.
fn split_front_matter(content: &str) -> Result<(String, String), FormatError> {
    if content.trim().is_empty() {
        return Err(FormatError::Empty);
    }

    let lines: Vec<&str> = content.lines().collect();

    let open = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .ok_or(FormatError::Empty)?;
    if lines[open].trim_end_matches('\r') != "---" {
        return Err(FormatError::MissingOpeningDelimiter);
    }

    let close = lines[open + 1..]
        .iter()
        .position(|l| l.trim_end_matches('\r') == "---")
        .map(|i| i + open + 1)
        .ok_or(FormatError::MissingClosingDelimiter)?;

    let yaml = lines[open + 1..close].join("\n");
    let body = lines[close + 1..].join("\n").trim().to_string();

    Ok((yaml, body))
}

/// Parse one issue file.
pub fn parse_issue(content: &str, path: &Path) -> Result<Issue, FormatError> {
    let (yaml, body) = split_front_matter(content)?;
    let raw: RawFrontmatter = serde_yaml::from_str(&yaml)?;

    // The `_at` spelling wins when a file carries both keys.
    let created = raw.created_at.or(raw.created);
    let updated = raw.updated_at.or(raw.updated);

    let state = match raw.state.as_deref() {
        None | Some("") => State::Open,
        Some(s) => State::from_str_lenient(s),
    };

    Ok(Issue {
        number: raw.number,
        title: raw.title,
        state,
        labels: raw.labels,
        assignees: raw.assignees,
        created_at: parse_flexible_datetime(created.as_deref().unwrap_or(""))
            .unwrap_or_else(zero_time),
        updated_at: parse_flexible_datetime(updated.as_deref().unwrap_or(""))
            .unwrap_or_else(zero_time),
        closed_at: raw
            .closed_at
            .as_deref()
            .and_then(parse_flexible_datetime),
        body,
        file_path: path.to_path_buf(),
    })
}

/// Serialize an issue to its canonical on-disk form.
pub fn serialize_issue(issue: &Issue) -> Result<String> {
    let fm = CanonicalFrontmatter {
        number: issue.number,
        title: &issue.title,
        state: issue.state.as_str(),
        labels: &issue.labels,
        assignees: &issue.assignees,
        created_at: canonical_timestamp(issue.created_at),
        updated_at: canonical_timestamp(issue.updated_at),
        closed_at: issue.closed_at.map(canonical_timestamp),
    };

    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&serde_yaml::to_string(&fm).context("Failed to serialize front-matter")?);
    out.push_str("---\n");

    let body = issue.body.trim();
    if !body.is_empty() {
        out.push('\n');
        out.push_str(body);
        out.push('\n');
    }

    Ok(out)
}

/// The single canonical timestamp shape: RFC3339, UTC, `Z`, second precision.
pub fn canonical_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Recognized datetime input shapes, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatetimeFormat {
    Rfc3339,
    Iso8601,
    DatetimeSpace,
    DatetimeShort,
    DateOnly,
    Empty,
    Unknown,
}

impl DatetimeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatetimeFormat::Rfc3339 => "rfc3339",
            DatetimeFormat::Iso8601 => "iso8601",
            DatetimeFormat::DatetimeSpace => "datetime-space",
            DatetimeFormat::DatetimeShort => "datetime-short",
            DatetimeFormat::DateOnly => "date-only",
            DatetimeFormat::Empty => "empty",
            DatetimeFormat::Unknown => "unknown",
        }
    }

    /// Formats the normalizer leaves alone: already canonical, or absent.
    pub fn is_canonical(&self) -> bool {
        matches!(self, DatetimeFormat::Rfc3339 | DatetimeFormat::Empty)
    }
}

impl std::fmt::Display for DatetimeFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify which recognizer a raw datetime string would hit.
pub fn detect_datetime_format(s: &str) -> DatetimeFormat {
    let s = s.trim();
    if s.is_empty() {
        return DatetimeFormat::Empty;
    }
    if DateTime::parse_from_rfc3339(s).is_ok() {
        return DatetimeFormat::Rfc3339;
    }
    if NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok() {
        return DatetimeFormat::Iso8601;
    }
    if NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok() {
        return DatetimeFormat::DatetimeSpace;
    }
    if NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").is_ok() {
        return DatetimeFormat::DatetimeShort;
    }
    if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
        return DatetimeFormat::DateOnly;
    }
    DatetimeFormat::Unknown
}

/// Keys that may carry datetimes, in front-matter order. Includes the
/// legacy aliases so the normalizer can report them.
pub const DATETIME_KEYS: &[&str] = &["created_at", "created", "updated_at", "updated", "closed_at"];

/// Raw datetime-bearing fields of a file with their detected formats,
/// as (key, raw value, format) tuples.
pub fn scan_datetime_fields(
    content: &str,
) -> Result<Vec<(String, String, DatetimeFormat)>, FormatError> {
    let (yaml, _) = split_front_matter(content)?;
    let value: serde_yaml::Value = serde_yaml::from_str(&yaml)?;

    let mut fields = Vec::new();
    for key in DATETIME_KEYS {
        if let Some(raw) = value.get(key).and_then(|v| v.as_str()) {
            fields.push((key.to_string(), raw.to_string(), detect_datetime_format(raw)));
        }
    }
    Ok(fields)
}

/// Parse a timestamp in any accepted shape. Values without a zone are UTC.
pub fn parse_flexible_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(t.and_utc());
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(t.and_utc());
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M") {
        return Some(t.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    }

    None
}
