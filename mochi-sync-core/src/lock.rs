//! # lock: persisted record of what was last synchronised
//!
//! The lock maps remote deck ids to the local directory they came from, and,
//! per deck, remote card ids to the source file they were parsed from plus
//! the content hashes of attachments already uploaded for them.
//!
//! All access goes through [`Lock`]'s accessors, which guard one in-memory
//! map with a reader/writer lock. Guards are never held across an `.await`.
//! Every effective mutation sets the `updated` flag; [`Lock::write`] only
//! touches disk when it is set.
//!
//! ## File format
//! A single JSON object keyed by deck id:
//!
//! ```json
//! { "deck1": { "path": "/a", "name": "A",
//!              "cards": { "card1": { "filename": "note.md",
//!                                    "images": { "img/x.png": "<sha256>" } } } } }
//! ```
//!
//! `cards` and `images` may be absent, which is the same as empty.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::contract::{Card, Deck};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown deck in lock: {0}")]
    UnknownDeck(String),

    #[error("unknown card in lock: deck {deck_id}, card {card_id}")]
    UnknownCard { deck_id: String, card_id: String },
}

/// A locked deck: the directory it mirrors and its cards.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeckRecord {
    pub path: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cards: BTreeMap<String, CardRecord>,
}

/// A locked card: its source filename and uploaded attachment hashes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CardRecord {
    pub filename: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct LockState {
    decks: BTreeMap<String, DeckRecord>,
    updated: bool,
}

/// The lock store.
#[derive(Debug)]
pub struct Lock {
    path: PathBuf,
    state: RwLock<LockState>,
}

impl Lock {
    /// An empty lock that will be written to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(LockState::default()),
        }
    }

    /// Load the lock from `path`. A missing file yields an empty lock.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "[LOCK] No lock file found, starting empty");
                return Ok(Self::new(path));
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let lock = Self::from_json(path, &raw)?;
        info!(
            path = %path.display(),
            decks = lock.read().decks.len(),
            "[LOCK] Loaded lock file"
        );
        Ok(lock)
    }

    /// Build a lock from its JSON representation.
    pub fn from_json(path: impl Into<PathBuf>, raw: &str) -> Result<Self, LockError> {
        let decks: BTreeMap<String, DeckRecord> = if raw.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(raw)?
        };
        Ok(Self {
            path: path.into(),
            state: RwLock::new(LockState {
                decks,
                updated: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, LockState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, LockState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether any mutation happened since load or the last write.
    pub fn is_updated(&self) -> bool {
        self.read().updated
    }

    /// Serialise the lock to pretty-printed JSON.
    pub fn serialize(&self) -> Result<String, LockError> {
        Ok(serde_json::to_string_pretty(&self.read().decks)?)
    }

    /// Persist the lock if it changed. Returns whether the file was written.
    ///
    /// Must only be called once concurrent mutation has quiesced.
    pub fn write(&self) -> Result<bool, LockError> {
        let mut state = self.write_state();
        if !state.updated {
            debug!(path = %self.path.display(), "[LOCK] Not updated, skipping write");
            return Ok(false);
        }
        let json = serde_json::to_string_pretty(&state.decks)?;
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json.as_bytes()).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        state.updated = false;
        info!(path = %self.path.display(), decks = state.decks.len(), "[LOCK] Wrote lock file");
        Ok(true)
    }

    /// Find the deck locked for directory `path`.
    pub fn get_deck(&self, path: &str) -> Option<(String, DeckRecord)> {
        self.read()
            .decks
            .iter()
            .find(|(_, deck)| deck.path == path)
            .map(|(id, deck)| (id.clone(), deck.clone()))
    }

    /// Snapshot of all locked decks keyed by id.
    pub fn decks(&self) -> BTreeMap<String, DeckRecord> {
        self.read().decks.clone()
    }

    /// Record deck `id` at directory `path` with display `name`.
    ///
    /// Existing cards of `id` are kept. Any other deck locked at the same path
    /// is evicted, so paths stay unique.
    pub fn set_deck(&self, id: &str, path: &str, name: &str) {
        let mut state = self.write_state();
        if let Some(deck) = state.decks.get(id) {
            if deck.path == path && deck.name == name {
                return;
            }
        }
        state.decks.retain(|other, deck| other == id || deck.path != path);
        let deck = state.decks.entry(id.to_string()).or_default();
        deck.path = path.to_string();
        deck.name = name.to_string();
        state.updated = true;
        debug!(deck_id = id, path, name, "[LOCK] Set deck");
    }

    /// Forget a deck and all its cards. Absent ids are ignored.
    pub fn remove_deck(&self, id: &str) {
        let mut state = self.write_state();
        if state.decks.remove(id).is_some() {
            state.updated = true;
            debug!(deck_id = id, "[LOCK] Removed deck");
        }
    }

    pub fn get_card(&self, deck_id: &str, card_id: &str) -> Option<CardRecord> {
        self.read()
            .decks
            .get(deck_id)
            .and_then(|deck| deck.cards.get(card_id))
            .cloned()
    }

    /// Snapshot of the cards locked under `deck_id` (empty if the deck is unknown).
    pub fn cards(&self, deck_id: &str) -> BTreeMap<String, CardRecord> {
        self.read()
            .decks
            .get(deck_id)
            .map(|deck| deck.cards.clone())
            .unwrap_or_default()
    }

    /// Record card `card_id` as parsed from `filename` under `deck_id`.
    ///
    /// The card is removed from any other deck it was locked under.
    pub fn set_card(&self, deck_id: &str, card_id: &str, filename: &str) -> Result<(), LockError> {
        let mut state = self.write_state();
        if !state.decks.contains_key(deck_id) {
            return Err(LockError::UnknownDeck(deck_id.to_string()));
        }
        let mut changed = false;
        for (id, deck) in state.decks.iter_mut() {
            if id != deck_id && deck.cards.remove(card_id).is_some() {
                changed = true;
            }
        }
        let cards = &mut state
            .decks
            .get_mut(deck_id)
            .ok_or_else(|| LockError::UnknownDeck(deck_id.to_string()))?
            .cards;
        match cards.get_mut(card_id) {
            Some(card) if card.filename == filename => {}
            Some(card) => {
                card.filename = filename.to_string();
                changed = true;
            }
            None => {
                cards.insert(
                    card_id.to_string(),
                    CardRecord {
                        filename: filename.to_string(),
                        images: BTreeMap::new(),
                    },
                );
                changed = true;
            }
        }
        if changed {
            state.updated = true;
            debug!(deck_id, card_id, filename, "[LOCK] Set card");
        }
        Ok(())
    }

    /// Forget a card. Absent entries are ignored.
    pub fn remove_card(&self, deck_id: &str, card_id: &str) {
        let mut state = self.write_state();
        let removed = state
            .decks
            .get_mut(deck_id)
            .and_then(|deck| deck.cards.remove(card_id))
            .is_some();
        if removed {
            state.updated = true;
            debug!(deck_id, card_id, "[LOCK] Removed card");
        }
    }

    pub fn get_attachment_hash(&self, deck_id: &str, card_id: &str, path: &str) -> Option<String> {
        self.read()
            .decks
            .get(deck_id)
            .and_then(|deck| deck.cards.get(card_id))
            .and_then(|card| card.images.get(path))
            .cloned()
    }

    pub fn set_attachment_hash(
        &self,
        deck_id: &str,
        card_id: &str,
        path: &str,
        hash: &str,
    ) -> Result<(), LockError> {
        let mut state = self.write_state();
        let deck = state
            .decks
            .get_mut(deck_id)
            .ok_or_else(|| LockError::UnknownDeck(deck_id.to_string()))?;
        let card = deck
            .cards
            .get_mut(card_id)
            .ok_or_else(|| LockError::UnknownCard {
                deck_id: deck_id.to_string(),
                card_id: card_id.to_string(),
            })?;
        if card.images.get(path).map(String::as_str) == Some(hash) {
            return Ok(());
        }
        card.images.insert(path.to_string(), hash.to_string());
        state.updated = true;
        Ok(())
    }

    /// Read-repair against the remote deck listing: drop decks that no longer
    /// exist and adopt remote names for the rest. Never calls the remote API.
    pub fn prune_decks(&self, remote: &[Deck]) {
        let remote: BTreeMap<&str, &Deck> = remote.iter().map(|d| (d.id.as_str(), d)).collect();
        let mut state = self.write_state();
        let before = state.decks.len();
        state.decks.retain(|id, _| remote.contains_key(id.as_str()));
        let mut changed = state.decks.len() != before;
        for (id, deck) in state.decks.iter_mut() {
            if let Some(remote) = remote.get(id.as_str()) {
                if remote.name != deck.name {
                    debug!(deck_id = %id, old = %deck.name, new = %remote.name, "[LOCK] Repaired deck name");
                    deck.name = remote.name.clone();
                    changed = true;
                }
            }
        }
        if changed {
            state.updated = true;
            info!(removed = before - state.decks.len(), "[LOCK] Pruned decks");
        }
    }

    /// Drop cards locked under `deck_id` that the remote no longer lists there.
    pub fn prune_cards(&self, deck_id: &str, remote: &[Card]) {
        let remote: BTreeSet<&str> = remote.iter().map(|c| c.id.as_str()).collect();
        let mut state = self.write_state();
        let Some(deck) = state.decks.get_mut(deck_id) else {
            return;
        };
        let before = deck.cards.len();
        deck.cards.retain(|id, _| remote.contains(id.as_str()));
        let removed = before - deck.cards.len();
        if removed > 0 {
            state.updated = true;
            debug!(deck_id, removed, "[LOCK] Pruned cards");
        }
    }

    /// Drop attachment hashes of a card whose paths are not in `current`.
    pub fn prune_attachments(&self, deck_id: &str, card_id: &str, current: &BTreeSet<String>) {
        let mut state = self.write_state();
        let Some(card) = state
            .decks
            .get_mut(deck_id)
            .and_then(|deck| deck.cards.get_mut(card_id))
        else {
            return;
        };
        let before = card.images.len();
        card.images.retain(|path, _| current.contains(path));
        if card.images.len() != before {
            state.updated = true;
        }
    }
}
