//! High-level pipeline: local notes → remote decks and cards.
//!
//! [`synchronise`] runs one reconciliation pass:
//!   - lists source files and groups them by directory, shallowest first
//!   - read-repairs the lock against the remote deck listing
//!   - resolves (creating if needed) one deck per directory, in order
//!   - per deck, concurrently: lists remote cards, parses sources, diffs
//!     (locked decks left without files are diffed against nothing)
//!   - executes all card operations on the bounded worker pool
//!   - optionally deletes decks whose directories are gone
//!   - writes the lock if anything changed
//!
//! # Error Handling
//! Planning (listing, resolution, parsing, diffing) stops at the first error.
//! Execution drains: failed operations are reported together, after every
//! other operation has run. Either way the lock is persisted with whatever
//! did succeed, so a rerun picks up where this one stopped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::SynchroniseConfig;
use crate::contract::{ClientError, Client, ConvertError, Template};
use crate::convert::rewrite_media_links;
use crate::differ::{diff, DeckContext, LocalCard};
use crate::executor::{ExecuteError, Executor};
use crate::grouper::{depth, group, DirectoryGroup};
use crate::lock::{Lock, LockError};
use crate::operation::{Attachment, Operation, Tally};
use crate::pagination::{list_all_cards, list_all_decks};
use crate::resolver::{DeckResolver, ResolveError};
use crate::walk::list_paths;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to list source files under {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to convert {path}: {source}")]
    Convert {
        path: String,
        #[source]
        source: ConvertError,
    },

    #[error("remote call failed: {0}")]
    Remote(#[source] ClientError),

    #[error("template {name:?} configured for {dir} does not exist")]
    UnknownTemplate { name: String, dir: String },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error("synchronisation cancelled")]
    Cancelled,
}

/// Summary of one synchronisation pass.
#[derive(Debug, Clone, Default)]
pub struct SynchroniseReport {
    pub tally: Tally,
    pub files: usize,
    pub decks: usize,
    /// Files that map to no deck (directly under the root).
    pub skipped_files: Vec<String>,
    pub lock_written: bool,
}

struct ResolvedGroup {
    group: DirectoryGroup,
    deck_id: String,
}

/// Run one synchronisation pass and persist the lock.
pub async fn synchronise<C>(
    config: &SynchroniseConfig,
    client: Arc<C>,
    lock: Arc<Lock>,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<SynchroniseReport, SyncError>
where
    C: Client + ?Sized + 'static,
{
    info!(root = %config.root.display(), "[SYNC] Starting synchronisation");
    let mut report = SynchroniseReport::default();
    let result = reconcile(config, &client, &lock, cancel, &mut report).await;

    match lock.write() {
        Ok(written) => report.lock_written = written,
        Err(e) => {
            error!(error = %e, "[SYNC][ERROR] Failed to write lock file");
            if result.is_ok() {
                return Err(e.into());
            }
        }
    }

    match result {
        Ok(()) => {
            info!(tally = %report.tally, lock_written = report.lock_written, "[SYNC] Synchronisation complete");
            Ok(report)
        }
        Err(SyncError::Execute(mut e)) => {
            // Report deck writes from resolution alongside executed operations.
            let mut tally = report.tally;
            tally.merge(&e.tally);
            e.tally = tally;
            error!(failures = e.failures.len(), tally = %e.tally, "[SYNC][ERROR] Some operations failed");
            Err(SyncError::Execute(e))
        }
        Err(e) => {
            error!(error = %e, "[SYNC][ERROR] Synchronisation failed");
            Err(e)
        }
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

async fn reconcile<C>(
    config: &SynchroniseConfig,
    client: &Arc<C>,
    lock: &Arc<Lock>,
    cancel: Option<watch::Receiver<bool>>,
    report: &mut SynchroniseReport,
) -> Result<(), SyncError>
where
    C: Client + ?Sized + 'static,
{
    let paths = list_paths(&config.root, &config.extensions).map_err(|source| SyncError::Walk {
        root: config.root.clone(),
        source,
    })?;
    report.files = paths.len();
    info!(files = paths.len(), "[SYNC] Listed source files");

    let remote_decks = list_all_decks(client.as_ref())
        .await
        .map_err(SyncError::Remote)?;
    lock.prune_decks(&remote_decks);

    let templates = load_templates(config, client.as_ref()).await?;

    // Resolution is sequential: groups arrive shallowest first, so every
    // ancestor deck exists before its children are resolved.
    let mut resolver = DeckResolver::new(client.as_ref(), lock.as_ref(), config);
    let mut resolved = Vec::new();
    for group in group(paths) {
        if is_cancelled(&cancel) {
            report.tally = resolver.tally();
            return Err(SyncError::Cancelled);
        }
        let deck_id = match resolver.resolve(&group.dir).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!(files = group.paths.len(), "[SYNC] Files directly under the root have no deck, skipping");
                report.skipped_files.extend(group.paths);
                continue;
            }
            Err(e) => {
                report.tally = resolver.tally();
                return Err(e.into());
            }
        };
        resolved.push(ResolvedGroup { group, deck_id });
    }
    report.tally = resolver.tally();
    report.decks = resolved.len();

    // Locked decks whose directory has no files left still get their cards
    // removed, unless the whole deck is about to be deleted.
    let stale = if config.delete_stale_decks {
        stale_decks(lock, &resolved)
    } else {
        Vec::new()
    };
    let emptied: Vec<ResolvedGroup> = lock
        .decks()
        .into_iter()
        .filter(|(id, _)| !resolved.iter().any(|r| &r.deck_id == id))
        .filter(|(id, _)| !stale.iter().any(|op| op.deck_id() == Some(id.as_str())))
        .map(|(deck_id, deck)| ResolvedGroup {
            group: DirectoryGroup {
                depth: depth(&deck.path),
                dir: deck.path,
                paths: Vec::new(),
            },
            deck_id,
        })
        .collect();
    if !emptied.is_empty() {
        debug!(decks = emptied.len(), "[SYNC] Decks without source files");
    }

    let ops: Vec<Operation> = stream::iter(resolved.iter().chain(emptied.iter()))
        .map(|entry| plan_deck(config, client.as_ref(), lock.as_ref(), &templates, entry))
        .buffer_unordered(config.workers.max(1))
        .try_concat()
        .await?;
    info!(operations = ops.len(), decks = resolved.len(), "[SYNC] Planned card operations");

    let mut executor = Executor::new(Arc::clone(client), Arc::clone(lock)).with_workers(config.workers);
    if let Some(rx) = &cancel {
        executor = executor.with_cancel(rx.clone());
    }
    let executed = executor.execute(ops).await;

    let mut stale_result = Ok(Tally::default());
    if !stale.is_empty() && !is_cancelled(&cancel) {
        info!(decks = stale.len(), "[SYNC] Deleting stale decks");
        // One worker: children must go before their parents.
        let mut sequential = Executor::new(Arc::clone(client), Arc::clone(lock)).with_workers(1);
        if let Some(rx) = &cancel {
            sequential = sequential.with_cancel(rx.clone());
        }
        stale_result = sequential.execute(stale).await;
    }

    match (executed, stale_result) {
        (Ok(cards), Ok(decks)) => {
            report.tally.merge(&cards);
            report.tally.merge(&decks);
            Ok(())
        }
        (executed, stale) => {
            let mut combined = ExecuteError {
                tally: Tally::default(),
                failures: Vec::new(),
            };
            for result in [executed, stale] {
                match result {
                    Ok(tally) => combined.tally.merge(&tally),
                    Err(e) => {
                        combined.tally.merge(&e.tally);
                        combined.failures.extend(e.failures);
                    }
                }
            }
            Err(SyncError::Execute(combined))
        }
    }
}

/// Templates referenced by the configuration, keyed by template name.
async fn load_templates<C>(
    config: &SynchroniseConfig,
    client: &C,
) -> Result<BTreeMap<String, Template>, SyncError>
where
    C: Client + ?Sized,
{
    let wanted: BTreeMap<&str, &str> = config
        .decks
        .iter()
        .filter_map(|(dir, deck)| deck.template.as_deref().map(|t| (t, dir.as_str())))
        .collect();
    if wanted.is_empty() {
        return Ok(BTreeMap::new());
    }
    let templates: BTreeMap<String, Template> = client
        .list_templates()
        .await
        .map_err(SyncError::Remote)?
        .into_iter()
        .map(|t| (t.name.clone(), t))
        .collect();
    for (name, dir) in wanted {
        if !templates.contains_key(name) {
            return Err(SyncError::UnknownTemplate {
                name: name.to_string(),
                dir: dir.to_string(),
            });
        }
    }
    debug!(count = templates.len(), "[SYNC] Loaded templates");
    Ok(templates)
}

/// List, parse and diff one deck.
async fn plan_deck<C>(
    config: &SynchroniseConfig,
    client: &C,
    lock: &Lock,
    templates: &BTreeMap<String, Template>,
    entry: &ResolvedGroup,
) -> Result<Vec<Operation>, SyncError>
where
    C: Client + ?Sized,
{
    let remote = list_all_cards(client, &entry.deck_id)
        .await
        .map_err(SyncError::Remote)?;
    lock.prune_cards(&entry.deck_id, &remote);

    let local = parse_group(config, &entry.group).await?;
    let locked = lock.cards(&entry.deck_id);
    let template = config
        .template_for(&entry.group.dir)
        .and_then(|name| templates.get(name));
    let ctx = DeckContext {
        deck_id: &entry.deck_id,
        locked: &locked,
        template,
        archive_removed: config.archive_removed,
    };
    let ops = diff(&ctx, &remote, local);
    debug!(
        dir = %entry.group.dir,
        deck_id = %entry.deck_id,
        remote = remote.len(),
        operations = ops.len(),
        "[SYNC] Diffed deck"
    );
    Ok(ops)
}

fn local_path(root: &Path, rel: &str) -> PathBuf {
    root.join(rel.trim_start_matches('/'))
}

/// Parse every file of a group and load the attachments its cards reference.
async fn parse_group(
    config: &SynchroniseConfig,
    group: &DirectoryGroup,
) -> Result<Vec<LocalCard>, SyncError> {
    let converter = config.parser_for(&group.dir).converter();
    let mut cards = Vec::new();
    for path in &group.paths {
        let file = local_path(&config.root, path);
        let source = tokio::fs::read(&file)
            .await
            .map_err(|source| SyncError::Read {
                path: file.clone(),
                source,
            })?;
        let parsed = converter
            .convert(path, &source)
            .map_err(|source| SyncError::Convert {
                path: path.clone(),
                source,
            })?;
        for mut card in parsed {
            let mut attachments =
                load_attachments(&config.root, &group.dir, path, &card.attachments).await;
            card.content = rewrite_media_links(&card.content, &attachments);
            // One upload per distinct content; duplicates share its media name.
            let mut seen = BTreeSet::new();
            attachments.retain(|a| seen.insert(a.hash.clone()));
            card.attachments = attachments.iter().map(|a| a.path.clone()).collect();
            cards.push(LocalCard {
                parsed: card,
                attachments,
            });
        }
    }
    Ok(cards)
}

/// Read referenced attachments. Missing files and links leaving the notes
/// root are logged and left out.
async fn load_attachments(
    root: &Path,
    dir: &str,
    source: &str,
    refs: &BTreeSet<String>,
) -> Vec<Attachment> {
    let mut attachments = Vec::new();
    for rel in refs {
        let Some(file) = confined_path(root, dir, rel).await else {
            warn!(source, attachment = %rel, "[SYNC] Attachment outside the notes root, skipping");
            continue;
        };
        match tokio::fs::read(&file).await {
            Ok(data) => attachments.push(Attachment::new(rel.clone(), data)),
            Err(e) => {
                warn!(source, attachment = %rel, error = %e, "[SYNC] Attachment not readable, skipping");
            }
        }
    }
    attachments
}

/// Resolve `rel` against the deck directory `dir`, or `None` if the result
/// is absolute or lies outside `root`.
async fn confined_path(root: &Path, dir: &str, rel: &str) -> Option<PathBuf> {
    let mut parts = Vec::new();
    let components = Path::new(dir.trim_start_matches('/'))
        .components()
        .chain(Path::new(rel).components());
    for component in components {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    let file = parts.iter().fold(root.to_path_buf(), |path, part| path.join(part));

    // A symlink inside the tree may still point out of it.
    if let (Ok(real_root), Ok(real_file)) = (
        tokio::fs::canonicalize(root).await,
        tokio::fs::canonicalize(&file).await,
    ) {
        if !real_file.starts_with(&real_root) {
            return None;
        }
    }
    Some(file)
}

/// Locked decks whose directory neither holds sources nor is an ancestor of
/// one, deepest first.
fn stale_decks(lock: &Lock, resolved: &[ResolvedGroup]) -> Vec<Operation> {
    let live: Vec<&str> = resolved.iter().map(|r| r.group.dir.as_str()).collect();
    let is_live = |path: &str| {
        live.iter().any(|dir| {
            *dir == path || dir.strip_prefix(path).is_some_and(|rest| rest.starts_with('/'))
        })
    };
    let mut stale: Vec<(String, String)> = lock
        .decks()
        .into_iter()
        .filter(|(_, deck)| !is_live(&deck.path))
        .map(|(id, deck)| (id, deck.path))
        .collect();
    stale.sort_by(|a, b| depth(&b.1).cmp(&depth(&a.1)).then_with(|| a.1.cmp(&b.1)));
    stale
        .into_iter()
        .map(|(deck_id, path)| Operation::DeleteDeck { deck_id, path })
        .collect()
}
