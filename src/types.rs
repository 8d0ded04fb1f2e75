use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Issue state
///
/// The canonical set is open/wip/done/closed. Values outside that set are
/// preserved verbatim so the repair tooling can report and rewrite them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum State {
    Open,
    Wip,
    Done,
    Closed,
    /// Non-canonical value found in front-matter, kept as-is.
    Unknown(String),
}

/// Deprecated state values and the canonical state each one rewrites to.
pub const LEGACY_STATE_ALIASES: &[(&str, State)] = &[
    ("in-progress", State::Wip),
    ("check", State::Wip),
    ("review", State::Wip),
];

impl State {
    /// Get the string representation of this state
    pub fn as_str(&self) -> &str {
        match self {
            State::Open => "open",
            State::Wip => "wip",
            State::Done => "done",
            State::Closed => "closed",
            State::Unknown(s) => s,
        }
    }

    /// Decode a front-matter state value. Case-sensitive; anything outside
    /// the canonical set is kept verbatim as `Unknown`.
    pub fn from_str_lenient(s: &str) -> State {
        match s {
            "open" => State::Open,
            "wip" => State::Wip,
            "done" => State::Done,
            "closed" => State::Closed,
            other => State::Unknown(other.to_string()),
        }
    }

    /// Parse a state the user typed. Only the canonical set is accepted.
    pub fn parse_canonical(s: &str) -> anyhow::Result<State> {
        match s {
            "open" => Ok(State::Open),
            "wip" => Ok(State::Wip),
            "done" => Ok(State::Done),
            "closed" => Ok(State::Closed),
            _ => Err(anyhow::anyhow!(
                "Invalid state: '{}'. Valid values are: open, wip, done, closed",
                s
            )),
        }
    }

    /// Resolve a legacy state-directory name. `in-progress` directories are
    /// accepted on read and map to `wip`.
    pub fn from_dir_name(name: &str) -> Option<State> {
        match name {
            "open" => Some(State::Open),
            "wip" => Some(State::Wip),
            "done" => Some(State::Done),
            "closed" => Some(State::Closed),
            "in-progress" => Some(State::Wip),
            _ => None,
        }
    }

    /// True for the four canonical states.
    pub fn is_canonical(&self) -> bool {
        !matches!(self, State::Unknown(_))
    }

    /// True for done or closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, State::Done | State::Closed)
    }

    /// True for open or wip.
    pub fn is_active(&self) -> bool {
        matches!(self, State::Open | State::Wip)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::parse_canonical(s)
    }
}

impl From<String> for State {
    fn from(s: String) -> Self {
        State::from_str_lenient(&s)
    }
}

impl From<State> for String {
    fn from(s: State) -> Self {
        s.as_str().to_string()
    }
}

/// The zero timestamp used for absent or unparseable datetimes.
pub fn zero_time() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Issue structure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub number: u32,
    pub title: String,
    pub state: State,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub body: String,
    /// Absolute path of the backing file. Never serialized.
    #[serde(skip)]
    pub file_path: PathBuf,
}

impl Issue {
    pub fn new(number: u32, title: String) -> Self {
        let now = Utc::now();
        Self {
            number,
            title,
            state: State::Open,
            labels: Vec::new(),
            assignees: Vec::new(),
            created_at: now,
            updated_at: now,
            closed_at: None,
            body: String::new(),
            file_path: PathBuf::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Whether `created_at` carries a real value (zero means the front-matter
    /// had no parseable creation time).
    pub fn has_created_at(&self) -> bool {
        self.created_at != zero_time()
    }

    /// True when the issue closed within the last `days` days.
    pub fn closed_within(&self, days: i64) -> bool {
        match self.closed_at {
            Some(t) => Utc::now().signed_duration_since(t) <= Duration::days(days),
            None => false,
        }
    }
}

/// A file whose front-matter could not be decoded.
///
/// Enumeration never aborts on these; they accumulate for the warnings
/// report and the optional repair tooling.
#[derive(Debug, Clone, Serialize)]
pub struct ParseFailure {
    pub path: PathBuf,
    pub filename: String,
    pub error: String,
    /// State inferred from the enclosing legacy directory; empty in the
    /// flat layout.
    pub state: String,
    /// Raw file contents, populated on demand for repair.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Statistics structure
#[derive(Debug, Serialize)]
pub struct Stats {
    pub total_issues: usize,
    pub active_issues: usize,
    pub closed_last_week: usize,
    pub by_state: BTreeMap<String, usize>,
    pub by_label: BTreeMap<String, usize>,
    pub by_assignee: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_lenient_keeps_unknown_verbatim() {
        assert_eq!(State::from_str_lenient("open"), State::Open);
        assert_eq!(State::from_str_lenient("wip"), State::Wip);
        // Case-sensitive: capitalized forms are not canonical.
        assert_eq!(
            State::from_str_lenient("Open"),
            State::Unknown("Open".to_string())
        );
        assert_eq!(
            State::from_str_lenient("in-progress"),
            State::Unknown("in-progress".to_string())
        );
    }

    #[test]
    fn test_state_canonical_rejects_aliases() {
        assert!(State::parse_canonical("done").is_ok());
        assert!(State::parse_canonical("in-progress").is_err());
        assert!(State::parse_canonical("").is_err());
    }

    #[test]
    fn test_dir_name_accepts_in_progress() {
        assert_eq!(State::from_dir_name("in-progress"), Some(State::Wip));
        assert_eq!(State::from_dir_name("done"), Some(State::Done));
        assert_eq!(State::from_dir_name("archive"), None);
    }

    #[test]
    fn test_closed_within_window() {
        let mut issue = Issue::new(1, "t".to_string());
        assert!(!issue.closed_within(7));

        issue.closed_at = Some(Utc::now() - Duration::days(2));
        assert!(issue.closed_within(7));
        assert!(!issue.closed_within(1));
    }

    #[test]
    fn test_zero_time_detection() {
        let mut issue = Issue::new(1, "t".to_string());
        assert!(issue.has_created_at());
        issue.created_at = zero_time();
        assert!(!issue.has_created_at());
    }
}
