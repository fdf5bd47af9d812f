use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::convert::ParserKind;
use crate::executor::default_workers;
use crate::ratelimit::RateLimit;

/// Per-directory settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeckConfig {
    /// Display name; defaults to the title-cased directory name.
    pub name: Option<String>,
    /// Parser for files in this directory and, unless overridden, below it.
    pub parser: Option<ParserKind>,
    /// Remote template name for cards of this deck.
    pub template: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SynchroniseConfig {
    /// Local directory mirrored to the remote service.
    pub root: PathBuf,
    /// File extensions (without dot) picked up under `root`.
    pub extensions: Vec<String>,
    pub workers: usize,
    pub rate_limit: RateLimit,
    /// Archive cards whose source disappeared instead of deleting them.
    pub archive_removed: bool,
    /// Delete locked decks that no longer have any source files.
    pub delete_stale_decks: bool,
    /// Settings keyed by root-anchored directory path.
    pub decks: BTreeMap<String, DeckConfig>,
}

impl SynchroniseConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: vec!["md".to_string()],
            workers: default_workers(),
            rate_limit: RateLimit::default(),
            archive_removed: false,
            delete_stale_decks: false,
            decks: BTreeMap::new(),
        }
    }

    /// Add settings for a directory. The key is normalised to `/a/b` form.
    pub fn with_deck(mut self, dir: &str, deck: DeckConfig) -> Self {
        self.decks.insert(normalize_dir(dir), deck);
        self
    }

    pub fn trace_loaded(&self) {
        info!(
            root = %self.root.display(),
            extensions = ?self.extensions,
            workers = self.workers,
            decks_configured = self.decks.len(),
            "Loaded SynchroniseConfig"
        );
        debug!(?self, "SynchroniseConfig loaded (full debug)");
    }

    /// Display name for the deck mirroring `dir`.
    pub fn deck_name(&self, dir: &str) -> String {
        self.decks
            .get(dir)
            .and_then(|d| d.name.clone())
            .unwrap_or_else(|| default_deck_name(dir))
    }

    /// Parser of the nearest configured ancestor (or `dir` itself).
    pub fn parser_for(&self, dir: &str) -> ParserKind {
        let mut current = dir.to_string();
        loop {
            if let Some(parser) = self.decks.get(&current).and_then(|d| d.parser) {
                return parser;
            }
            if current == "/" {
                return ParserKind::default();
            }
            current = crate::grouper::parent_dir(&current);
        }
    }

    pub fn template_for(&self, dir: &str) -> Option<&str> {
        self.decks.get(dir).and_then(|d| d.template.as_deref())
    }
}

/// Normalise a directory key: `a/b/`, `/a/b` and `./a/b` all become `/a/b`.
pub fn normalize_dir(dir: &str) -> String {
    let trimmed = dir.trim().trim_start_matches("./").trim_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Title-cased last path segment: `/lang/spanish-verbs` → `Spanish Verbs`.
pub fn default_deck_name(dir: &str) -> String {
    let segment = dir.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    segment
        .split(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
