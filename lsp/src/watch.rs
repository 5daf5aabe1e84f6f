//! File-watch service seam.
//!
//! The editor owns change detection. A session only tells it which glob
//! patterns matter; the host delivers the resulting changes back as
//! [`EditorEvent::FileChanged`](crate::types::EditorEvent::FileChanged).

/// Editor-provided file-watch service.
pub trait FileWatchService: Send + Sync {
    /// Start watching `patterns`. Called once, when a session starts.
    fn register(&self, patterns: &[String]) -> anyhow::Result<()>;

    /// Stop watching. Called once, when a started session stops.
    fn unregister(&self);
}

/// Watcher for hosts that feed file events in some other way.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatcher;

impl FileWatchService for NoopWatcher {
    fn register(&self, patterns: &[String]) -> anyhow::Result<()> {
        tracing::debug!(?patterns, "No file watcher installed; ignoring registration");
        Ok(())
    }

    fn unregister(&self) {}
}
