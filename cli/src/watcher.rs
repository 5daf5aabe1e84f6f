//! Polling file watcher over the workspace.
//!
//! Registration starts a background scan loop; each tick walks the
//! workspace (honouring `.gitignore`), diffs modification times against the
//! previous scan, and emits one `FileChanged` per difference.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{Context, anyhow};
use ferret_lsp::{EditorEvent, FileChangeKind, FileWatchService};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Upper bound on files tracked per scan.
const MAX_FILES_SCAN: usize = 10_000;

const EVENT_CHANNEL_CAPACITY: usize = 256;

type Snapshot = BTreeMap<PathBuf, SystemTime>;

pub struct PollingWatcher {
    root: PathBuf,
    period: Duration,
    events_tx: mpsc::Sender<EditorEvent>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl PollingWatcher {
    pub fn new(root: PathBuf, period: Duration) -> (Self, mpsc::Receiver<EditorEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let watcher = Self {
            root,
            period,
            events_tx,
            cancel: Mutex::new(None),
        };
        (watcher, events_rx)
    }
}

impl FileWatchService for PollingWatcher {
    fn register(&self, patterns: &[String]) -> anyhow::Result<()> {
        let matcher = build_matcher(patterns)?;
        let cancel = CancellationToken::new();
        {
            let mut slot = self
                .cancel
                .lock()
                .map_err(|_| anyhow!("watcher state poisoned"))?;
            if let Some(previous) = slot.replace(cancel.clone()) {
                previous.cancel();
            }
        }

        tracing::info!(root = %self.root.display(), ?patterns, "Watching workspace files");
        tokio::spawn(poll_loop(
            self.root.clone(),
            matcher,
            self.period,
            self.events_tx.clone(),
            cancel,
        ));
        Ok(())
    }

    fn unregister(&self) {
        if let Ok(mut slot) = self.cancel.lock()
            && let Some(cancel) = slot.take()
        {
            tracing::debug!("Stopping workspace file watch");
            cancel.cancel();
        }
    }
}

fn build_matcher(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).with_context(|| format!("invalid watch pattern {pattern:?}"))?;
        builder.add(glob);
    }
    builder.build().context("building watch patterns")
}

async fn poll_loop(
    root: PathBuf,
    matcher: GlobSet,
    period: Duration,
    events_tx: mpsc::Sender<EditorEvent>,
    cancel: CancellationToken,
) {
    let mut known = match scan_in_background(&root, &matcher).await {
        Some(snapshot) => snapshot,
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(current) = scan_in_background(&root, &matcher).await else {
            break;
        };
        for (path, kind) in diff(&known, &current) {
            let Ok(uri) = Url::from_file_path(&path) else {
                continue;
            };
            if events_tx
                .send(EditorEvent::FileChanged { uri, kind })
                .await
                .is_err()
            {
                return;
            }
        }
        known = current;
    }
}

async fn scan_in_background(root: &Path, matcher: &GlobSet) -> Option<Snapshot> {
    let root = root.to_path_buf();
    let matcher = matcher.clone();
    match tokio::task::spawn_blocking(move || scan(&root, &matcher)).await {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::warn!("Workspace scan failed: {e}");
            None
        }
    }
}

fn scan(root: &Path, matcher: &GlobSet) -> Snapshot {
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .filter_entry(|entry| {
            !matches!(
                entry.file_name().to_string_lossy().as_ref(),
                ".git" | "target" | "node_modules"
            )
        })
        .build();

    let mut snapshot = Snapshot::new();
    for entry in walker.flatten() {
        if snapshot.len() >= MAX_FILES_SCAN {
            tracing::debug!(limit = MAX_FILES_SCAN, "Workspace scan truncated");
            break;
        }
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }
        let path = entry.path();
        if !matcher.is_match(path) {
            continue;
        }
        if let Some(modified) = entry.metadata().ok().and_then(|meta| meta.modified().ok()) {
            snapshot.insert(path.to_path_buf(), modified);
        }
    }
    snapshot
}

fn diff(before: &Snapshot, after: &Snapshot) -> Vec<(PathBuf, FileChangeKind)> {
    let mut changes = Vec::new();
    for (path, modified) in after {
        match before.get(path) {
            None => changes.push((path.clone(), FileChangeKind::Created)),
            Some(previous) if previous != modified => {
                changes.push((path.clone(), FileChangeKind::Changed));
            }
            Some(_) => {}
        }
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            changes.push((path.clone(), FileChangeKind::Deleted));
        }
    }
    changes
}
