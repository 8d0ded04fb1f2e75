mod conflict;
mod format;
mod git;
mod migrate;
mod refgraph;
mod slug;
mod storage;
mod types;
mod watch;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use format::canonical_timestamp;
use git::SystemGit;
use refgraph::{ConnectedIssue, RefDirection, RefGraph};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use storage::Store;
use types::{Issue, State};
use watch::DirWatcher;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Name of the issue directory created by `dk init` and searched for by
/// every other command.
const DEFAULT_DIR_NAME: &str = "issues";

#[derive(Parser)]
#[command(name = "dk", about = "Docket - a file-backed Markdown issue tracker", version)]
struct Cli {
    /// Path to the issue directory (supports DOCKET_DIR env var)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Output JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Disable command logging to issues/command_history.log
    #[arg(long, global = true)]
    no_cmd_logging: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize an issue directory
    Init,

    /// Create a new issue
    New {
        /// Issue title
        title: String,

        /// Labels (can be specified multiple times)
        #[arg(short, long)]
        label: Vec<String>,

        /// Assignees (can be specified multiple times)
        #[arg(short, long)]
        assignee: Vec<String>,

        /// Markdown body
        #[arg(short, long, default_value = "")]
        body: String,
    },

    /// List issues
    List {
        /// Filter by state (can be specified multiple times)
        #[arg(long, value_parser = State::parse_canonical)]
        state: Vec<State>,

        /// Filter by label
        #[arg(long)]
        label: Option<String>,

        /// Filter by assignee
        #[arg(long)]
        assignee: Option<String>,
    },

    /// Show issue details
    Show {
        /// Issue number
        number: u32,

        /// Also show connected issues
        #[arg(long)]
        refs: bool,
    },

    /// Search issues by keyword
    Search {
        /// Keyword to look for in titles and bodies
        keyword: String,

        /// Match titles only
        #[arg(long)]
        title_only: bool,
    },

    /// Move an issue to another state
    Move {
        /// Issue number
        number: u32,

        /// Target state (open, wip, done, closed)
        #[arg(value_parser = State::parse_canonical)]
        state: State,
    },

    /// Close an issue (moves it to done)
    Close {
        /// Issue number
        number: u32,
    },

    /// Reopen a closed issue
    Reopen {
        /// Issue number
        number: u32,
    },

    /// Get statistics
    Stats,

    /// List files that failed to parse
    Warnings {
        /// Include the raw file contents
        #[arg(long)]
        content: bool,
    },

    /// Detect and repair numbering conflicts
    Repair {
        /// Print the plan without touching files
        #[arg(long)]
        dry_run: bool,
    },

    /// Rewrite legacy datetime formats and deprecated states
    Normalize {
        /// Print what would change without touching files
        #[arg(long)]
        dry_run: bool,
    },

    /// Migrate a legacy per-state layout to the flat layout
    Migrate {
        /// Print what would move without touching files
        #[arg(long)]
        dry_run: bool,
    },

    /// Show issues connected to an issue by #N references
    Refs {
        /// Issue number
        number: u32,
    },

    /// Watch the issue directory and report changes
    Watch,

    /// Show version information
    Version,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let dir = match &cli.dir {
                Some(dir) => dir.clone(),
                None => match env::var("DOCKET_DIR") {
                    Ok(dir) => PathBuf::from(dir),
                    Err(_) => PathBuf::from(DEFAULT_DIR_NAME),
                },
            };
            let store = Store::init(dir)?;

            // Log command after successful init
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            if !cli.json {
                println!("Initialized issue directory: {}", store.dir().display());
            }
            Ok(())
        }

        Commands::New {
            title,
            label,
            assignee,
            body,
        } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let issue = store.create(&title, label, assignee, body)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&issue)?);
            } else {
                println!(
                    "Created issue #{}: {}",
                    issue.number,
                    issue
                        .file_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                );
            }
            Ok(())
        }

        Commands::List {
            state,
            label,
            assignee,
        } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let mut issues = match (&label, &assignee) {
                (Some(l), _) => store.filter_by_label(l, &state)?,
                (None, Some(a)) => store.filter_by_assignee(a, &state)?,
                (None, None) => store.list(&state)?.0,
            };
            if let (Some(_), Some(a)) = (&label, &assignee) {
                let a = a.to_lowercase();
                issues.retain(|i| i.assignees.iter().any(|x| x.to_lowercase() == a));
            }

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&issues)?);
            } else {
                for issue in &issues {
                    print_issue_line(issue);
                }
            }
            warn_about_failures(&store);
            Ok(())
        }

        Commands::Show { number, refs } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let (issues, _) = store.list(&[])?;
            let issue = issues
                .iter()
                .find(|i| i.number == number)
                .ok_or_else(|| anyhow::anyhow!("issue #{} not found", number))?;

            if cli.json {
                if refs {
                    let graph = RefGraph::build(&issues);
                    let payload = serde_json::json!({
                        "issue": issue,
                        "connected": graph.connected(number),
                    });
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                } else {
                    println!("{}", serde_json::to_string_pretty(&[issue])?);
                }
            } else {
                println!("#{}: {}", issue.number, issue.title);
                println!("State: {}", issue.state);
                if !issue.labels.is_empty() {
                    println!("Labels: {}", issue.labels.join(", "));
                }
                if !issue.assignees.is_empty() {
                    println!("Assignees: {}", issue.assignees.join(", "));
                }
                println!("Created: {}", canonical_timestamp(issue.created_at));
                println!("Updated: {}", canonical_timestamp(issue.updated_at));
                if let Some(closed) = issue.closed_at {
                    println!("Closed: {}", canonical_timestamp(closed));
                }
                if !issue.body.is_empty() {
                    println!("\n{}", issue.body);
                }
                if refs {
                    println!();
                    print_connected(number, &issues);
                }
            }
            Ok(())
        }

        Commands::Search {
            keyword,
            title_only,
        } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let issues = store.search(&keyword, title_only)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&issues)?);
            } else {
                for issue in &issues {
                    print_issue_line(issue);
                }
            }
            warn_about_failures(&store);
            Ok(())
        }

        Commands::Move { number, state } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let issue = store.move_state(number, state)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&[&issue])?);
            } else {
                println!("Moved issue #{} to {}", number, issue.state);
            }
            Ok(())
        }

        Commands::Close { number } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let issue = store.move_state(number, State::Done)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&[&issue])?);
            } else {
                println!("Closed issue #{}", number);
            }
            Ok(())
        }

        Commands::Reopen { number } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let issue = store.move_state(number, State::Open)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&[&issue])?);
            } else {
                println!("Reopened issue #{}", number);
            }
            Ok(())
        }

        Commands::Stats => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let stats = store.stats()?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Total issues: {}", stats.total_issues);
                println!("Active: {}", stats.active_issues);
                println!("Closed last week: {}", stats.closed_last_week);
                if !stats.by_state.is_empty() {
                    println!("\nBy state:");
                    for (state, count) in &stats.by_state {
                        println!("  {}: {}", state, count);
                    }
                }
                if !stats.by_label.is_empty() {
                    println!("\nBy label:");
                    for (label, count) in &stats.by_label {
                        println!("  {}: {}", label, count);
                    }
                }
                if !stats.by_assignee.is_empty() {
                    println!("\nBy assignee:");
                    for (assignee, count) in &stats.by_assignee {
                        println!("  {}: {}", assignee, count);
                    }
                }
            }
            Ok(())
        }

        Commands::Warnings { content } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            store.list(&[])?;
            let failures = if content {
                store.warnings_with_content()
            } else {
                store.warnings()
            };

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&failures)?);
            } else if failures.is_empty() {
                println!("No parse failures.");
            } else {
                for failure in &failures {
                    if failure.state.is_empty() {
                        println!("{}: {}", failure.filename, failure.error);
                    } else {
                        println!("{} [{}]: {}", failure.filename, failure.state, failure.error);
                    }
                    if let Some(raw) = &failure.content {
                        for line in raw.lines() {
                            println!("    {}", line);
                        }
                    }
                }
            }
            Ok(())
        }

        Commands::Repair { dry_run } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let report = conflict::repair(store.dir(), &SystemGit, dry_run)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.conflicts_found == 0 {
                println!("No conflicts found.");
            } else {
                println!(
                    "Found {} conflict(s), {} fix(es) planned.",
                    report.conflicts_found,
                    report.plans.len()
                );
                let verb = if report.dry_run { "would apply" } else { "applied" };
                for line in &report.applied {
                    println!("  {}: {}", verb, line);
                }
                for line in &report.failed {
                    eprintln!("  failed: {}", line);
                }
            }
            Ok(())
        }

        Commands::Normalize { dry_run } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let datetimes = conflict::normalize_datetimes(store.dir(), dry_run)?;
            let states = conflict::normalize_states(store.dir(), dry_run)?;

            if cli.json {
                let payload = serde_json::json!({
                    "datetimes": datetimes,
                    "states": states,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_normalize_report("datetimes", &datetimes);
                print_normalize_report("states", &states);
            }
            Ok(())
        }

        Commands::Migrate { dry_run } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let report = migrate::migrate(store.dir(), &SystemGit, dry_run)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                if report.migrated == 0 && report.failed == 0 {
                    println!("No legacy issues to migrate.");
                } else if report.dry_run {
                    println!("Would migrate {} issue(s).", report.migrated);
                } else {
                    println!("Migrated {} issue(s) to the flat layout.", report.migrated);
                }
                for error in &report.errors {
                    eprintln!("  failed: {}", error);
                }
            }
            Ok(())
        }

        Commands::Refs { number } => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let (issues, _) = store.list(&[])?;
            let issue = issues
                .iter()
                .find(|i| i.number == number)
                .ok_or_else(|| anyhow::anyhow!("issue #{} not found", number))?;

            if cli.json {
                let graph = RefGraph::build(&issues);
                println!("{}", serde_json::to_string_pretty(&graph.connected(number))?);
            } else {
                println!("#{}: {}", issue.number, issue.title);
                print_connected(number, &issues);
            }
            Ok(())
        }

        Commands::Watch => {
            let store = get_store(&cli.dir)?;

            // Log command after store is validated
            if !cli.no_cmd_logging {
                let _ = log_command(store.dir(), &env::args().collect::<Vec<_>>());
            }

            let watcher = DirWatcher::watch(store.dir())?;
            if !cli.json {
                println!(
                    "Watching {} for changes (Ctrl-C to stop)",
                    store.dir().display()
                );
            }

            loop {
                match watcher.reloads().recv_timeout(Duration::from_millis(250)) {
                    Ok(()) => {
                        let (issues, failures) = store.list(&[])?;
                        if cli.json {
                            let payload = serde_json::json!({
                                "type": "reload",
                                "issues": issues.len(),
                                "parse_failures": failures.len(),
                                "timestamp": Utc::now().to_rfc3339(),
                            });
                            println!("{}", payload);
                        } else {
                            println!(
                                "[{}] reload: {} issue(s), {} parse failure(s)",
                                Utc::now().format("%H:%M:%S"),
                                issues.len(),
                                failures.len()
                            );
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        anyhow::bail!("Directory watcher stopped")
                    }
                }
                for error in watcher.errors().try_iter() {
                    eprintln!("watch error: {}", error);
                }
            }
        }

        Commands::Version => {
            println!(
                "dk {} ({}, built {})",
                built_info::PKG_VERSION,
                built_info::GIT_COMMIT_HASH_SHORT.unwrap_or("no git"),
                env!("BUILD_DATE")
            );
            Ok(())
        }
    }
}

fn print_issue_line(issue: &Issue) {
    println!("#{}: {} [{}]", issue.number, issue.title, issue.state);
}

/// Point at parse failures from the last enumeration without failing the
/// command; `dk warnings` has the details.
fn warn_about_failures(store: &Store) {
    let failures = store.warnings();
    if !failures.is_empty() {
        eprintln!(
            "warning: {} file(s) failed to parse; run 'dk warnings' for details",
            failures.len()
        );
    }
}

fn print_normalize_report(what: &str, report: &conflict::NormalizeReport) {
    let verb = if report.dry_run {
        "would rewrite"
    } else {
        "rewrote"
    };
    println!(
        "Normalized {}: examined {}, {} {}, flagged {}",
        what,
        report.examined,
        verb,
        report.rewritten.len(),
        report.flagged.len()
    );
    for filename in &report.rewritten {
        println!("  {}: {}", verb, filename);
    }
    for filename in &report.flagged {
        println!("  flagged: {}", filename);
    }
}

/// Render the connected set as two trees, one per direction, grouped by
/// the issue each node was discovered from.
fn print_connected(root: u32, issues: &[Issue]) {
    let graph = RefGraph::build(issues);
    let connected = graph.connected(root);
    if connected.is_empty() {
        println!("No references.");
        return;
    }

    let titles: BTreeMap<u32, String> = issues
        .iter()
        .map(|i| (i.number, i.title.clone()))
        .collect();

    for (direction, heading) in [
        (RefDirection::Mentions, "Mentions:"),
        (RefDirection::MentionedBy, "Mentioned by:"),
    ] {
        let branch: Vec<ConnectedIssue> = connected
            .iter()
            .filter(|c| c.direction == direction)
            .cloned()
            .collect();
        if branch.is_empty() {
            continue;
        }
        println!("{}", heading);
        let tree = refgraph::build_tree(&branch);
        print_branch(&tree, root, 1, &titles);
    }
}

fn print_branch(
    tree: &BTreeMap<u32, Vec<u32>>,
    node: u32,
    depth: usize,
    titles: &BTreeMap<u32, String>,
) {
    let Some(children) = tree.get(&node) else {
        return;
    };
    for &child in children {
        let title = titles.get(&child).map(String::as_str).unwrap_or("");
        println!("{}#{} {}", "  ".repeat(depth), child, title);
        print_branch(tree, child, depth + 1, titles);
    }
}

fn get_store(dir_arg: &Option<PathBuf>) -> Result<Store> {
    let issues_dir = if let Some(dir) = dir_arg {
        dir.clone()
    } else if let Ok(dir) = env::var("DOCKET_DIR") {
        PathBuf::from(dir)
    } else {
        // Search for an issues directory
        find_issues_dir()?
    };

    Store::open(issues_dir).context("Failed to open issue directory")
}

fn find_issues_dir() -> Result<PathBuf> {
    let mut current = env::current_dir()?;

    loop {
        let issues_dir = current.join(DEFAULT_DIR_NAME);
        if issues_dir.exists() && issues_dir.is_dir() {
            return Ok(issues_dir);
        }

        if !current.pop() {
            anyhow::bail!("No issues directory found. Run 'dk init' to create one.");
        }
    }
}

/// Log command to command_history.log
fn log_command(issues_dir: &Path, args: &[String]) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;

    let log_path = issues_dir.join("command_history.log");
    let timestamp = Utc::now().to_rfc3339();

    // Skip the first argument (binary path) and only log the CLI options
    let command_line = if args.len() > 1 {
        args[1..].join(" ")
    } else {
        String::new()
    };

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open command history log")?;

    writeln!(file, "{} {}", timestamp, command_line)
        .context("Failed to write to command history log")?;

    Ok(())
}
