//! Bookmark pagination over [`Client`] listings.
//!
//! An empty page ends the listing. A missing, empty or repeated bookmark also
//! ends it, as does the literal `"nil"` bookmark some API responses carry.

use tracing::debug;

use crate::contract::{Card, Client, ClientError, Deck, Page};

const NIL_BOOKMARK: &str = "nil";

/// Returns the bookmark for the next page, or `None` if `page` is the last.
pub fn next_bookmark<T>(page: &Page<T>, previous: Option<&str>) -> Option<String> {
    if page.items.is_empty() {
        return None;
    }
    let bookmark = page.bookmark.as_deref()?.trim();
    if bookmark.is_empty() || bookmark == NIL_BOOKMARK || Some(bookmark) == previous {
        return None;
    }
    Some(bookmark.to_string())
}

pub async fn list_all_decks<C>(client: &C) -> Result<Vec<Deck>, ClientError>
where
    C: Client + ?Sized,
{
    let mut decks = Vec::new();
    let mut bookmark: Option<String> = None;
    loop {
        let page = client.list_decks_page(bookmark.clone()).await?;
        let next = next_bookmark(&page, bookmark.as_deref());
        decks.extend(page.items);
        match next {
            Some(b) => bookmark = Some(b),
            None => break,
        }
    }
    debug!(count = decks.len(), "[CLIENT] Listed decks");
    Ok(decks)
}

pub async fn list_all_cards<C>(client: &C, deck_id: &str) -> Result<Vec<Card>, ClientError>
where
    C: Client + ?Sized,
{
    let mut cards = Vec::new();
    let mut bookmark: Option<String> = None;
    loop {
        let page = client
            .list_cards_page(deck_id.to_string(), bookmark.clone())
            .await?;
        let next = next_bookmark(&page, bookmark.as_deref());
        // Some listings include cards of sub-decks; keep this deck's only.
        cards.extend(page.items.into_iter().filter(|c| c.deck_id == deck_id));
        match next {
            Some(b) => bookmark = Some(b),
            None => break,
        }
    }
    debug!(deck_id, count = cards.len(), "[CLIENT] Listed cards");
    Ok(cards)
}
