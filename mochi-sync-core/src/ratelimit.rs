//! Token-bucket rate limiting for the remote client.
//!
//! [`RateLimited`] wraps any [`Client`] and makes every call take one token
//! from a bucket shared by all callers, so concurrent workers are throttled to
//! a steady rate instead of tripping the provider's limits.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::contract::{Card, CardUpdate, Client, ClientError, Deck, NewCard, NewDeck, Page, Template};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Steady-state requests per second.
    pub per_second: f64,
    /// Requests allowed back to back from a full bucket.
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            per_second: 5.0,
            burst: 5,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// A token bucket. Waiters are served in arrival order.
#[derive(Debug)]
pub struct TokenBucket {
    limit: RateLimit,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        let limit = RateLimit {
            per_second: if limit.per_second > 0.0 { limit.per_second } else { 1.0 },
            burst: limit.burst.max(1),
        };
        Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(limit.burst),
                last: Instant::now(),
            }),
            limit,
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let refill = now.duration_since(bucket.last).as_secs_f64() * self.limit.per_second;
        bucket.tokens = (bucket.tokens + refill).min(f64::from(self.limit.burst));
        bucket.last = now;
        if bucket.tokens < 1.0 {
            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.limit.per_second);
            trace!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            // The mutex stays held so later callers queue behind this one.
            tokio::time::sleep(wait).await;
            bucket.tokens = 1.0;
            bucket.last = Instant::now();
        }
        bucket.tokens -= 1.0;
    }
}

/// A [`Client`] whose every call first takes a token from a shared bucket.
pub struct RateLimited<C> {
    inner: C,
    bucket: TokenBucket,
}

impl<C> RateLimited<C> {
    pub fn new(inner: C, limit: RateLimit) -> Self {
        Self {
            inner,
            bucket: TokenBucket::new(limit),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: Client> Client for RateLimited<C> {
    async fn create_deck(&self, req: NewDeck) -> Result<Deck, ClientError> {
        self.bucket.acquire().await;
        self.inner.create_deck(req).await
    }

    async fn update_deck(&self, deck_id: String, name: String) -> Result<Deck, ClientError> {
        self.bucket.acquire().await;
        self.inner.update_deck(deck_id, name).await
    }

    async fn list_decks_page(&self, bookmark: Option<String>) -> Result<Page<Deck>, ClientError> {
        self.bucket.acquire().await;
        self.inner.list_decks_page(bookmark).await
    }

    async fn delete_deck(&self, deck_id: String) -> Result<(), ClientError> {
        self.bucket.acquire().await;
        self.inner.delete_deck(deck_id).await
    }

    async fn create_card(&self, req: NewCard) -> Result<Card, ClientError> {
        self.bucket.acquire().await;
        self.inner.create_card(req).await
    }

    async fn update_card(&self, card_id: String, update: CardUpdate) -> Result<Card, ClientError> {
        self.bucket.acquire().await;
        self.inner.update_card(card_id, update).await
    }

    async fn list_cards_page(
        &self,
        deck_id: String,
        bookmark: Option<String>,
    ) -> Result<Page<Card>, ClientError> {
        self.bucket.acquire().await;
        self.inner.list_cards_page(deck_id, bookmark).await
    }

    async fn delete_card(&self, card_id: String) -> Result<(), ClientError> {
        self.bucket.acquire().await;
        self.inner.delete_card(card_id).await
    }

    async fn add_attachment(
        &self,
        card_id: String,
        name: String,
        data: Vec<u8>,
    ) -> Result<(), ClientError> {
        self.bucket.acquire().await;
        self.inner.add_attachment(card_id, name, data).await
    }

    async fn list_templates(&self) -> Result<Vec<Template>, ClientError> {
        self.bucket.acquire().await;
        self.inner.list_templates().await
    }
}
