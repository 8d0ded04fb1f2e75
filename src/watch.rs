//! Directory watcher for live views of the issue directory.
//!
//! Wraps an OS change notifier and boils its event stream down to a single
//! signal: "the issue directory may have changed, re-read it". Bursts of
//! events (editors write several times, repairs touch many files) are
//! coalesced with a trailing debounce, and the reload channel holds at most
//! one pending signal. Losing a signal is safe: subscribers reload the whole
//! store on every signal anyway.

use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::thread;
use std::time::{Duration, Instant};

/// Wait this long after the last relevant event before signaling a reload.
const DEBOUNCE_MS: u64 = 100;

/// Watches one issue directory and delivers debounced reload signals.
pub struct DirWatcher {
    reload_rx: Receiver<()>,
    error_rx: Receiver<String>,
    _watcher: RecommendedWatcher,
}

impl DirWatcher {
    /// Start watching `dir`. Only changes to `.md` entries count.
    pub fn watch(dir: &Path) -> Result<DirWatcher> {
        let (event_tx, event_rx) = mpsc::channel();
        let (reload_tx, reload_rx) = mpsc::sync_channel(1);
        let (error_tx, error_rx) = mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = event_tx.send(res);
            },
            Config::default(),
        )
        .context("Failed to create directory watcher")?;
        watcher
            .watch(dir, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch issue directory: {}", dir.display()))?;

        thread::spawn(move || run_debounce_loop(event_rx, reload_tx, error_tx));

        Ok(DirWatcher {
            reload_rx,
            error_rx,
            _watcher: watcher,
        })
    }

    /// Reload signals. At most one is ever buffered; subscribers should
    /// re-read the whole store on every signal.
    pub fn reloads(&self) -> &Receiver<()> {
        &self.reload_rx
    }

    /// Watch errors. These do not stop the watch.
    pub fn errors(&self) -> &Receiver<String> {
        &self.error_rx
    }
}

/// Reads raw notifier events and emits debounced reload signals.
///
/// The reload channel is a one-slot buffer written with `try_send`: if the
/// subscriber has not consumed the previous signal yet, the new one is
/// dropped rather than blocking the loop. Exits when the notifier side of
/// the event channel closes.
fn run_debounce_loop(
    events: Receiver<notify::Result<Event>>,
    reload_tx: SyncSender<()>,
    error_tx: Sender<String>,
) {
    let debounce = Duration::from_millis(DEBOUNCE_MS);
    let mut pending = false;
    let mut last_event = Instant::now();

    loop {
        let timeout = if pending {
            debounce.saturating_sub(last_event.elapsed())
        } else {
            Duration::from_secs(3600)
        };

        match events.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                if is_relevant(&event) {
                    pending = true;
                    last_event = Instant::now();
                }
            }
            Ok(Err(e)) => {
                let _ = error_tx.send(e.to_string());
            }
            Err(RecvTimeoutError::Timeout) => {
                if pending && last_event.elapsed() >= debounce {
                    match reload_tx.try_send(()) {
                        Ok(()) | Err(TrySendError::Full(())) => {}
                        Err(TrySendError::Disconnected(())) => break,
                    }
                    pending = false;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn is_relevant(event: &Event) -> bool {
    let touches_markdown = event
        .paths
        .iter()
        .any(|p| p.extension().and_then(|s| s.to_str()) == Some("md"));
    if !touches_markdown {
        return false;
    }
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
