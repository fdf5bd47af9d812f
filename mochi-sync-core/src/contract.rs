//! # contract: the seams between the engine and the outside world
//!
//! This module defines the two traits the reconciliation engine talks through,
//! plus the plain data types crossing them:
//!
//! - [`Client`]: logical operations of the remote flashcard API (decks, cards,
//!   templates, attachments) with cursor pagination.
//! - [`Converter`]: turns one source document into parsed cards.
//!
//! ## Mocking & Testing
//! Both traits are annotated for `mockall`, so tests (and downstream crates
//! with the `test-export-mocks` feature) get `MockClient` / `MockConverter`.
//!
//! ## Errors
//! The remote seam uses a boxed error ([`ClientError`]); implementors convert
//! transport and API failures into it. The engine wraps it into its own typed
//! errors one level up.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use mockall::automock;

/// Error type for the remote client seam.
pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// A remote deck, as returned by listing or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deck {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub archived: bool,
}

/// Data needed to create a deck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeck {
    pub name: String,
    pub parent_id: Option<String>,
}

/// A remote card snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Card {
    pub id: String,
    pub deck_id: String,
    pub name: String,
    pub content: String,
    /// Field values keyed by template field id.
    pub fields: BTreeMap<String, String>,
    pub pos: Option<String>,
    pub template_id: Option<String>,
    pub archived: bool,
}

/// Data needed to create a card.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewCard {
    pub deck_id: String,
    pub name: String,
    pub content: String,
    pub template_id: Option<String>,
    /// Field values keyed by template field id.
    pub fields: BTreeMap<String, String>,
    pub pos: Option<String>,
}

/// A partial card update. `None` leaves the remote value untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CardUpdate {
    pub content: Option<String>,
    pub fields: Option<BTreeMap<String, String>>,
    pub pos: Option<String>,
    pub archived: Option<bool>,
}

impl CardUpdate {
    /// True when the update would not change anything remotely.
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.fields.is_none() && self.pos.is_none() && self.archived.is_none()
    }
}

/// A card template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: String,
    pub name: String,
    /// Fields keyed by field id.
    pub fields: BTreeMap<String, TemplateField>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateField {
    pub id: String,
    pub name: String,
    pub pos: String,
}

impl Template {
    /// The field used as a card's identity: the one named `name`, otherwise
    /// the field with the lowest position.
    pub fn name_field(&self) -> Option<&TemplateField> {
        self.fields
            .values()
            .find(|f| f.name.eq_ignore_ascii_case("name"))
            .or_else(|| self.fields.values().min_by(|a, b| a.pos.cmp(&b.pos)))
    }

    /// Look up a field id by its display name.
    pub fn field_id(&self, name: &str) -> Option<&str> {
        self.fields
            .values()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.id.as_str())
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub bookmark: Option<String>,
}

/// Trait for the remote flashcard service.
///
/// Writes return the full updated resource. Implementations are shared by all
/// executor workers, so they must be stateless or internally synchronised.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Client: Send + Sync {
    async fn create_deck(&self, req: NewDeck) -> Result<Deck, ClientError>;

    /// Rename a deck.
    async fn update_deck(&self, deck_id: String, name: String) -> Result<Deck, ClientError>;

    /// Fetch one page of decks. `None` requests the first page.
    async fn list_decks_page(&self, bookmark: Option<String>) -> Result<Page<Deck>, ClientError>;

    async fn delete_deck(&self, deck_id: String) -> Result<(), ClientError>;

    async fn create_card(&self, req: NewCard) -> Result<Card, ClientError>;

    async fn update_card(&self, card_id: String, update: CardUpdate) -> Result<Card, ClientError>;

    /// Fetch one page of cards filed under `deck_id`.
    async fn list_cards_page(
        &self,
        deck_id: String,
        bookmark: Option<String>,
    ) -> Result<Page<Card>, ClientError>;

    async fn delete_card(&self, card_id: String) -> Result<(), ClientError>;

    /// Upload a media attachment to a card under `name`.
    async fn add_attachment(
        &self,
        card_id: String,
        name: String,
        data: Vec<u8>,
    ) -> Result<(), ClientError>;

    async fn list_templates(&self) -> Result<Vec<Template>, ClientError>;
}

/// A card produced by a [`Converter`] from a source document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedCard {
    /// Display name, the identity key for untemplated decks.
    pub name: String,
    pub content: String,
    /// Field values keyed by template field *name*.
    pub fields: BTreeMap<String, String>,
    pub pos: Option<String>,
    /// Source filename (base name, not the full path).
    pub filename: String,
    /// Local attachment paths referenced by the card, relative to the source
    /// file's directory.
    pub attachments: BTreeSet<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("source is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("{path}: {message}")]
    Invalid { path: String, message: String },
}

/// Trait for turning a source document into cards.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait Converter: Send + Sync {
    /// Convert the document at `path` (root-anchored) with content `source`.
    fn convert(&self, path: &str, source: &[u8]) -> Result<Vec<ParsedCard>, ConvertError>;
}
