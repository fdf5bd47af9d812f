//! # differ: minimal card operations for one deck
//!
//! Cards are matched per source file, not by content hash, so an edited card
//! keeps its remote identity:
//!
//! 1. Remote cards the lock does not know under this deck are orphans and get
//!    deleted; nothing ties them to a source file.
//! 2. Locked remote cards and local cards are grouped by filename.
//! 3. Within a filename, cards match on their identity key (the card name, or
//!    the template's name field for templated decks), first match in
//!    encounter order. Matched pairs are updated only when something differs;
//!    unmatched remote cards are removed; leftover local cards are created.
//! 4. Files with no remote cards yet have all their cards created; files that
//!    disappeared locally have all their cards removed.
//!
//! Removal means delete, or archive when the deck is configured to archive.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::contract::{Card, CardUpdate, NewCard, ParsedCard, Template};
use crate::lock::CardRecord;
use crate::operation::{Attachment, Operation};

/// A parsed card together with its attachments read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCard {
    pub parsed: ParsedCard,
    pub attachments: Vec<Attachment>,
}

impl From<ParsedCard> for LocalCard {
    fn from(parsed: ParsedCard) -> Self {
        Self {
            parsed,
            attachments: Vec::new(),
        }
    }
}

/// What the differ needs to know about the deck being reconciled.
#[derive(Debug, Clone, Copy)]
pub struct DeckContext<'a> {
    pub deck_id: &'a str,
    /// Lock snapshot of the deck's cards.
    pub locked: &'a BTreeMap<String, CardRecord>,
    pub template: Option<&'a Template>,
    pub archive_removed: bool,
}

impl DeckContext<'_> {
    fn remote_key<'c>(&self, card: &'c Card) -> Option<&'c str> {
        match self.template.and_then(Template::name_field) {
            Some(field) => card.fields.get(&field.id).map(String::as_str),
            None => Some(card.name.as_str()),
        }
    }

    fn local_key<'c>(&self, card: &'c ParsedCard) -> &'c str {
        self.template
            .and_then(Template::name_field)
            .and_then(|field| {
                card.fields
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(&field.name))
                    .map(|(_, value)| value.as_str())
            })
            .unwrap_or(card.name.as_str())
    }

    /// Parsed field values re-keyed by template field id.
    fn field_ids(&self, card: &ParsedCard) -> BTreeMap<String, String> {
        let Some(template) = self.template else {
            return BTreeMap::new();
        };
        card.fields
            .iter()
            .filter_map(|(name, value)| match template.field_id(name) {
                Some(id) => Some((id.to_string(), value.clone())),
                None => {
                    warn!(field = %name, template = %template.name, filename = %card.filename, "[DIFF] Unknown template field ignored");
                    None
                }
            })
            .collect()
    }

    fn removal(&self, card: &Card) -> Option<Operation> {
        if !self.archive_removed {
            return Some(Operation::DeleteCard {
                deck_id: self.deck_id.to_string(),
                card_id: card.id.clone(),
            });
        }
        if card.archived {
            return None;
        }
        Some(Operation::ArchiveCard {
            deck_id: self.deck_id.to_string(),
            card_id: card.id.clone(),
        })
    }

    fn create(&self, local: LocalCard) -> Operation {
        let fields = self.field_ids(&local.parsed);
        let ParsedCard {
            name,
            content,
            pos,
            filename,
            ..
        } = local.parsed;
        Operation::CreateCard {
            filename,
            card: NewCard {
                deck_id: self.deck_id.to_string(),
                name,
                content,
                template_id: self.template.map(|t| t.id.clone()),
                fields,
                pos,
            },
            attachments: local.attachments,
        }
    }

    /// An update for a matched pair, or `None` if the remote card is current.
    fn update(&self, remote: &Card, local: LocalCard) -> Option<Operation> {
        let fields = self.field_ids(&local.parsed);
        let mut update = CardUpdate::default();
        if remote.content != local.parsed.content {
            update.content = Some(local.parsed.content.clone());
        }
        // Untemplated decks never own remote fields.
        if self.template.is_some() && fields != remote.fields {
            update.fields = Some(fields);
        }
        if local.parsed.pos.is_some() && local.parsed.pos != remote.pos {
            update.pos = local.parsed.pos.clone();
        }
        if remote.archived {
            update.archived = Some(false);
        }

        let images = self.locked.get(&remote.id).map(|record| &record.images);
        let attachment_paths: BTreeSet<String> =
            local.attachments.iter().map(|a| a.path.clone()).collect();
        let changed_attachments: Vec<Attachment> = local
            .attachments
            .into_iter()
            .filter(|a| images.and_then(|i| i.get(&a.path)) != Some(&a.hash))
            .collect();

        if update.is_empty() && changed_attachments.is_empty() {
            return None;
        }
        Some(Operation::UpdateCard {
            deck_id: self.deck_id.to_string(),
            card_id: remote.id.clone(),
            filename: local.parsed.filename,
            update,
            attachments: changed_attachments,
            attachment_paths,
        })
    }
}

/// Compute the operations converging `remote` (the cards currently filed under
/// the deck) with `local` (the freshly parsed cards for its directory).
pub fn diff(ctx: &DeckContext<'_>, remote: &[Card], local: Vec<LocalCard>) -> Vec<Operation> {
    let mut ops = Vec::new();

    let mut remote_by_file: BTreeMap<&str, Vec<&Card>> = BTreeMap::new();
    for card in remote {
        match ctx.locked.get(&card.id) {
            Some(record) => remote_by_file
                .entry(record.filename.as_str())
                .or_default()
                .push(card),
            None => {
                debug!(deck_id = ctx.deck_id, card_id = %card.id, "[DIFF] Orphan card");
                ops.push(Operation::DeleteCard {
                    deck_id: ctx.deck_id.to_string(),
                    card_id: card.id.clone(),
                });
            }
        }
    }

    let mut local_by_file: BTreeMap<String, Vec<LocalCard>> = BTreeMap::new();
    for card in local {
        local_by_file
            .entry(card.parsed.filename.clone())
            .or_default()
            .push(card);
    }

    for (filename, locals) in local_by_file {
        let Some(remotes) = remote_by_file.remove(filename.as_str()) else {
            ops.extend(locals.into_iter().map(|card| ctx.create(card)));
            continue;
        };
        let mut unmatched: Vec<Option<&Card>> = remotes.into_iter().map(Some).collect();
        for card in locals {
            let key = ctx.local_key(&card.parsed);
            let matched = unmatched
                .iter_mut()
                .find(|slot| matches!(**slot, Some(r) if ctx.remote_key(r) == Some(key)))
                .and_then(Option::take);
            match matched {
                Some(remote) => ops.extend(ctx.update(remote, card)),
                None => ops.push(ctx.create(card)),
            }
        }
        ops.extend(unmatched.into_iter().flatten().filter_map(|r| ctx.removal(r)));
    }

    // Source files that no longer produce any card.
    for (filename, remotes) in remote_by_file {
        debug!(deck_id = ctx.deck_id, filename, cards = remotes.len(), "[DIFF] Source file gone");
        ops.extend(remotes.into_iter().filter_map(|r| ctx.removal(r)));
    }

    ops
}
