//! In-memory remote service shared by the integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use mochi_sync_core::contract::{
    Card, CardUpdate, Client, ClientError, Deck, NewCard, NewDeck, Page, Template,
};

#[derive(Debug, Default)]
pub struct FakeState {
    pub decks: BTreeMap<String, Deck>,
    pub cards: BTreeMap<String, Card>,
    pub templates: Vec<Template>,
    /// (card id, media name) per uploaded attachment.
    pub attachments: Vec<(String, String)>,
    pub writes: usize,
    pub reads: usize,
    next_id: usize,
}

/// A remote service keeping decks and cards in memory. Listings are split into
/// pages of `page_size`, with `"nil"` as the final bookmark.
pub struct FakeClient {
    pub state: Mutex<FakeState>,
    page_size: usize,
}

impl Default for FakeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            page_size: 2,
        }
    }

    pub fn with_templates(self, templates: Vec<Template>) -> Self {
        self.state.lock().unwrap().templates = templates;
        self
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn reset_counters(&self) {
        let mut state = self.state.lock().unwrap();
        state.writes = 0;
        state.reads = 0;
    }

    pub fn deck_by_name(&self, name: &str) -> Option<Deck> {
        self.state
            .lock()
            .unwrap()
            .decks
            .values()
            .find(|d| d.name == name)
            .cloned()
    }

    pub fn cards_in(&self, deck_id: &str) -> Vec<Card> {
        self.state
            .lock()
            .unwrap()
            .cards
            .values()
            .filter(|c| c.deck_id == deck_id)
            .cloned()
            .collect()
    }

    /// Insert a card directly, bypassing write counting.
    pub fn seed_card(&self, card: Card) {
        self.state.lock().unwrap().cards.insert(card.id.clone(), card);
    }

    fn page<T: Clone>(&self, items: Vec<T>, bookmark: Option<String>) -> Page<T> {
        let start: usize = bookmark.and_then(|b| b.parse().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(items.len());
        let slice = items.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
        let bookmark = if end < items.len() {
            end.to_string()
        } else {
            "nil".to_string()
        };
        Page {
            items: slice,
            bookmark: Some(bookmark),
        }
    }
}

fn next_id(state: &mut FakeState, prefix: &str) -> String {
    state.next_id += 1;
    format!("{prefix}{}", state.next_id)
}

#[async_trait]
impl Client for FakeClient {
    async fn create_deck(&self, req: NewDeck) -> Result<Deck, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        let deck = Deck {
            id: next_id(&mut state, "deck-"),
            name: req.name,
            parent_id: req.parent_id,
            archived: false,
        };
        state.decks.insert(deck.id.clone(), deck.clone());
        Ok(deck)
    }

    async fn update_deck(&self, deck_id: String, name: String) -> Result<Deck, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        let deck = state
            .decks
            .get_mut(&deck_id)
            .ok_or_else(|| format!("no deck {deck_id}"))?;
        deck.name = name;
        Ok(deck.clone())
    }

    async fn list_decks_page(&self, bookmark: Option<String>) -> Result<Page<Deck>, ClientError> {
        let items: Vec<Deck> = {
            let mut state = self.state.lock().unwrap();
            state.reads += 1;
            state.decks.values().cloned().collect()
        };
        Ok(self.page(items, bookmark))
    }

    async fn delete_deck(&self, deck_id: String) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        state
            .decks
            .remove(&deck_id)
            .ok_or_else(|| format!("no deck {deck_id}"))?;
        state.cards.retain(|_, c| c.deck_id != deck_id);
        Ok(())
    }

    async fn create_card(&self, req: NewCard) -> Result<Card, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        if !state.decks.contains_key(&req.deck_id) {
            return Err(format!("no deck {}", req.deck_id).into());
        }
        let card = Card {
            id: next_id(&mut state, "card-"),
            deck_id: req.deck_id,
            name: req.name,
            content: req.content,
            fields: req.fields,
            pos: req.pos,
            template_id: req.template_id,
            archived: false,
        };
        state.cards.insert(card.id.clone(), card.clone());
        Ok(card)
    }

    async fn update_card(&self, card_id: String, update: CardUpdate) -> Result<Card, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        let card = state
            .cards
            .get_mut(&card_id)
            .ok_or_else(|| format!("no card {card_id}"))?;
        if let Some(content) = update.content {
            card.content = content;
        }
        if let Some(fields) = update.fields {
            card.fields = fields;
        }
        if let Some(pos) = update.pos {
            card.pos = Some(pos);
        }
        if let Some(archived) = update.archived {
            card.archived = archived;
        }
        Ok(card.clone())
    }

    async fn list_cards_page(
        &self,
        deck_id: String,
        bookmark: Option<String>,
    ) -> Result<Page<Card>, ClientError> {
        let items: Vec<Card> = {
            let mut state = self.state.lock().unwrap();
            state.reads += 1;
            state
                .cards
                .values()
                .filter(|c| c.deck_id == deck_id)
                .cloned()
                .collect()
        };
        Ok(self.page(items, bookmark))
    }

    async fn delete_card(&self, card_id: String) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        state
            .cards
            .remove(&card_id)
            .ok_or_else(|| format!("no card {card_id}"))?;
        Ok(())
    }

    async fn add_attachment(
        &self,
        card_id: String,
        name: String,
        _data: Vec<u8>,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        state.attachments.push((card_id, name));
        Ok(())
    }

    async fn list_templates(&self) -> Result<Vec<Template>, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.reads += 1;
        Ok(state.templates.clone())
    }
}
