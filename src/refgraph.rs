use crate::types::Issue;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::LazyLock;

static REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\d+)").unwrap());

/// Issue numbers referenced as `#N` in `text`, sorted and deduplicated.
/// `#0` is dropped; so are numbers too large to be issue numbers.
pub fn extract_refs(text: &str) -> Vec<u32> {
    let mut refs: BTreeSet<u32> = BTreeSet::new();
    for caps in REF_RE.captures_iter(text) {
        if let Ok(n) = caps[1].parse::<u32>() {
            if n > 0 {
                refs.insert(n);
            }
        }
    }
    refs.into_iter().collect()
}

/// Which side of a reference edge a connected issue was reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefDirection {
    Mentions,
    MentionedBy,
}

/// One issue reached from the starting point of a connectivity walk.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedIssue {
    pub number: u32,
    pub distance: u32,
    pub direction: RefDirection,
    /// The issue this one was discovered from.
    pub parent: u32,
}

/// Bidirectional `#N` reference index over the parseable issues.
///
/// Self-references and references to numbers with no backing issue are
/// dropped at build time, so both maps only ever point at real issues.
#[derive(Debug, Default)]
pub struct RefGraph {
    numbers: BTreeSet<u32>,
    mentions: BTreeMap<u32, Vec<u32>>,
    mentioned_by: BTreeMap<u32, Vec<u32>>,
}

impl RefGraph {
    pub fn build(issues: &[Issue]) -> Self {
        let numbers: BTreeSet<u32> = issues.iter().map(|i| i.number).collect();

        let mut mentions: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        let mut mentioned_by: BTreeMap<u32, Vec<u32>> = BTreeMap::new();

        for issue in issues {
            for referenced in extract_refs(&issue.body) {
                if referenced == issue.number || !numbers.contains(&referenced) {
                    continue;
                }
                mentions.entry(issue.number).or_default().push(referenced);
                mentioned_by.entry(referenced).or_default().push(issue.number);
            }
        }

        for targets in mentioned_by.values_mut() {
            targets.sort_unstable();
            targets.dedup();
        }

        RefGraph {
            numbers,
            mentions,
            mentioned_by,
        }
    }

    pub fn contains(&self, number: u32) -> bool {
        self.numbers.contains(&number)
    }

    /// Issues `number` references in its body.
    pub fn mentions(&self, number: u32) -> &[u32] {
        self.mentions.get(&number).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Issues whose bodies reference `number`.
    pub fn mentioned_by(&self, number: u32) -> &[u32] {
        self.mentioned_by
            .get(&number)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Everything reachable from `root` by following references.
    ///
    /// The walk fans out in both directions at distance 1, then each branch
    /// keeps to the direction it started in: a node reached through
    /// `mentions` expands only through `mentions`, and likewise for
    /// `mentioned_by`. A visited set absorbs cycles, so every node appears
    /// at most once, at its shortest distance. Results are ordered by
    /// (distance, mentions first, number).
    pub fn connected(&self, root: u32) -> Vec<ConnectedIssue> {
        let mut visited: HashSet<u32> = HashSet::new();
        visited.insert(root);

        let mut queue: VecDeque<ConnectedIssue> = VecDeque::new();
        let mut result: Vec<ConnectedIssue> = Vec::new();

        for direction in [RefDirection::Mentions, RefDirection::MentionedBy] {
            for &next in self.neighbors(root, direction) {
                if visited.insert(next) {
                    queue.push_back(ConnectedIssue {
                        number: next,
                        distance: 1,
                        direction,
                        parent: root,
                    });
                }
            }
        }

        while let Some(item) = queue.pop_front() {
            for &next in self.neighbors(item.number, item.direction) {
                if visited.insert(next) {
                    queue.push_back(ConnectedIssue {
                        number: next,
                        distance: item.distance + 1,
                        direction: item.direction,
                        parent: item.number,
                    });
                }
            }
            result.push(item);
        }

        result.sort_by_key(|c| (c.distance, c.direction, c.number));
        result
    }

    fn neighbors(&self, number: u32, direction: RefDirection) -> &[u32] {
        match direction {
            RefDirection::Mentions => self.mentions(number),
            RefDirection::MentionedBy => self.mentioned_by(number),
        }
    }
}

/// Group a connectivity result by discovery parent, for tree rendering.
/// Children keep the result order.
pub fn build_tree(items: &[ConnectedIssue]) -> BTreeMap<u32, Vec<u32>> {
    let mut tree: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for item in items {
        tree.entry(item.parent).or_default().push(item.number);
    }
    tree
}
