//! Synchronization policy: which editor events reach the server.
//!
//! The policy is fixed when a session is built. Document events pass when
//! the document's URI scheme and language match a selector; file events pass
//! when the file path matches a watched glob.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::{DocumentId, EditorEvent};

fn default_scheme() -> String {
    String::from("file")
}

/// A `(scheme, language-id)` filter for editor documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DocumentSelector {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub language: String,
}

impl DocumentSelector {
    #[must_use]
    pub fn new(scheme: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            language: language.into(),
        }
    }

    #[must_use]
    pub fn matches(&self, document: &DocumentId) -> bool {
        document.uri.scheme() == self.scheme && document.language_id == self.language
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid watch pattern {pattern:?}: {source}")]
pub struct PolicyError {
    pattern: String,
    #[source]
    source: globset::Error,
}

/// Immutable synchronization filter for one session.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    selectors: Vec<DocumentSelector>,
    patterns: Vec<String>,
    watched: GlobSet,
}

impl SyncPolicy {
    /// Build a policy. Duplicate selectors and patterns are dropped;
    /// first-seen order is kept.
    pub fn new<P>(
        selectors: impl IntoIterator<Item = DocumentSelector>,
        patterns: impl IntoIterator<Item = P>,
    ) -> Result<Self, PolicyError>
    where
        P: Into<String>,
    {
        let mut unique_selectors = Vec::new();
        for selector in selectors {
            if !unique_selectors.contains(&selector) {
                unique_selectors.push(selector);
            }
        }

        let mut unique_patterns: Vec<String> = Vec::new();
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.into();
            if unique_patterns.contains(&pattern) {
                continue;
            }
            let glob = Glob::new(&pattern).map_err(|source| PolicyError {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
            unique_patterns.push(pattern);
        }
        let watched = builder.build().map_err(|source| PolicyError {
            pattern: unique_patterns.join(", "),
            source,
        })?;

        Ok(Self {
            selectors: unique_selectors,
            patterns: unique_patterns,
            watched,
        })
    }

    #[must_use]
    pub fn selectors(&self) -> &[DocumentSelector] {
        &self.selectors
    }

    /// Glob patterns registered with the file-watch service.
    #[must_use]
    pub fn watched_patterns(&self) -> &[String] {
        &self.patterns
    }

    #[must_use]
    pub fn accepts_document(&self, document: &DocumentId) -> bool {
        self.selectors.iter().any(|s| s.matches(document))
    }

    /// Whether a changed file falls under a watched pattern. Non-file URIs
    /// are matched on their path component.
    #[must_use]
    pub fn accepts_file(&self, uri: &Url) -> bool {
        match uri.to_file_path() {
            Ok(path) => self.watched.is_match(path),
            Err(()) => self.watched.is_match(uri.path()),
        }
    }

    #[must_use]
    pub fn accepts(&self, event: &EditorEvent) -> bool {
        match event {
            EditorEvent::FileChanged { uri, .. } => self.accepts_file(uri),
            other => other
                .document()
                .is_some_and(|document| self.accepts_document(document)),
        }
    }
}
