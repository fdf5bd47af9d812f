//! Intended remote mutations, produced by deck resolution and card diffing
//! and consumed by the executor.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::contract::{CardUpdate, NewCard};

/// A local file referenced by a card, with the bytes to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Path relative to the referencing source file's directory.
    pub path: String,
    /// Remote media name, derived from the hash.
    pub name: String,
    /// SHA-256 hex digest of `data`.
    pub hash: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        let path = path.into();
        let hash = content_hash(&data);
        let name = media_name(&path, &hash);
        Self {
            path,
            name,
            hash,
            data,
        }
    }
}

/// SHA-256 hex digest of `data`.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Remote media name for an attachment: a hash prefix plus the original extension.
pub fn media_name(path: &str, hash: &str) -> String {
    let stem = &hash[..hash.len().min(16)];
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.{}", ext.to_ascii_lowercase()),
        None => stem.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateDeck {
        path: String,
        name: String,
        parent_id: Option<String>,
    },
    UpdateDeckName {
        deck_id: String,
        path: String,
        name: String,
    },
    DeleteDeck {
        deck_id: String,
        path: String,
    },
    CreateCard {
        filename: String,
        card: NewCard,
        attachments: Vec<Attachment>,
    },
    UpdateCard {
        deck_id: String,
        card_id: String,
        filename: String,
        update: CardUpdate,
        /// Attachments whose hash differs from the lock.
        attachments: Vec<Attachment>,
        /// Every attachment path the card references now.
        attachment_paths: BTreeSet<String>,
    },
    ArchiveCard {
        deck_id: String,
        card_id: String,
    },
    DeleteCard {
        deck_id: String,
        card_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateDeck,
    UpdateDeckName,
    DeleteDeck,
    CreateCard,
    UpdateCard,
    ArchiveCard,
    DeleteCard,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateDeck { .. } => OperationKind::CreateDeck,
            Operation::UpdateDeckName { .. } => OperationKind::UpdateDeckName,
            Operation::DeleteDeck { .. } => OperationKind::DeleteDeck,
            Operation::CreateCard { .. } => OperationKind::CreateCard,
            Operation::UpdateCard { .. } => OperationKind::UpdateCard,
            Operation::ArchiveCard { .. } => OperationKind::ArchiveCard,
            Operation::DeleteCard { .. } => OperationKind::DeleteCard,
        }
    }

    /// Deck the operation touches, if it already exists remotely.
    pub fn deck_id(&self) -> Option<&str> {
        match self {
            Operation::CreateDeck { .. } => None,
            Operation::UpdateDeckName { deck_id, .. }
            | Operation::DeleteDeck { deck_id, .. }
            | Operation::UpdateCard { deck_id, .. }
            | Operation::ArchiveCard { deck_id, .. }
            | Operation::DeleteCard { deck_id, .. } => Some(deck_id),
            Operation::CreateCard { card, .. } => Some(&card.deck_id),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateDeck { path, name, .. } => write!(f, "create deck {name:?} for {path}"),
            Operation::UpdateDeckName { deck_id, name, .. } => {
                write!(f, "rename deck {deck_id} to {name:?}")
            }
            Operation::DeleteDeck { deck_id, path } => write!(f, "delete deck {deck_id} ({path})"),
            Operation::CreateCard { filename, card, .. } => {
                write!(f, "create card from {filename} in deck {}", card.deck_id)
            }
            Operation::UpdateCard {
                card_id, filename, ..
            } => write!(f, "update card {card_id} from {filename}"),
            Operation::ArchiveCard { card_id, .. } => write!(f, "archive card {card_id}"),
            Operation::DeleteCard { card_id, .. } => write!(f, "delete card {card_id}"),
        }
    }
}

/// Per-kind counts of applied operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub decks_created: usize,
    pub decks_renamed: usize,
    pub decks_deleted: usize,
    pub cards_created: usize,
    pub cards_updated: usize,
    pub cards_archived: usize,
    pub cards_deleted: usize,
    pub attachments_uploaded: usize,
}

impl Tally {
    pub fn record(&mut self, kind: OperationKind) {
        match kind {
            OperationKind::CreateDeck => self.decks_created += 1,
            OperationKind::UpdateDeckName => self.decks_renamed += 1,
            OperationKind::DeleteDeck => self.decks_deleted += 1,
            OperationKind::CreateCard => self.cards_created += 1,
            OperationKind::UpdateCard => self.cards_updated += 1,
            OperationKind::ArchiveCard => self.cards_archived += 1,
            OperationKind::DeleteCard => self.cards_deleted += 1,
        }
    }

    pub fn merge(&mut self, other: &Tally) {
        self.decks_created += other.decks_created;
        self.decks_renamed += other.decks_renamed;
        self.decks_deleted += other.decks_deleted;
        self.cards_created += other.cards_created;
        self.cards_updated += other.cards_updated;
        self.cards_archived += other.cards_archived;
        self.cards_deleted += other.cards_deleted;
        self.attachments_uploaded += other.attachments_uploaded;
    }

    /// Total remote writes, attachments included.
    pub fn total(&self) -> usize {
        self.decks_created
            + self.decks_renamed
            + self.decks_deleted
            + self.cards_created
            + self.cards_updated
            + self.cards_archived
            + self.cards_deleted
            + self.attachments_uploaded
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "decks: {} created, {} renamed, {} deleted; cards: {} created, {} updated, {} archived, {} deleted; {} attachments uploaded",
            self.decks_created,
            self.decks_renamed,
            self.decks_deleted,
            self.cards_created,
            self.cards_updated,
            self.cards_archived,
            self.cards_deleted,
            self.attachments_uploaded
        )
    }
}
