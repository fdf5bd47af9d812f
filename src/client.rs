//! HTTP implementation of the core [`Client`] trait against the Mochi REST API.
//!
//! Authentication is HTTP basic auth with the API key as username and an
//! empty password. List endpoints return `{ "docs": [...], "bookmark": ... }`.

use std::collections::BTreeMap;
use std::env;

use async_trait::async_trait;
use mochi_sync_core::contract::{
    Card, CardUpdate, Client, ClientError, Deck, NewCard, NewDeck, Page, Template, TemplateField,
};
use mochi_sync_core::pagination::next_bookmark;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

pub const DEFAULT_BASE_URL: &str = "https://app.mochi.cards/api/";

/// Connection settings, normally taken from the environment.
#[derive(Clone)]
pub struct MochiConfig {
    pub api_key: String,
    pub base_url: String,
}

impl std::fmt::Debug for MochiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MochiConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl MochiConfig {
    /// Reads `MOCHI_API_KEY` and optionally `MOCHI_BASE_URL`.
    pub fn from_env() -> Result<Self, ClientError> {
        let api_key = env::var("MOCHI_API_KEY").map_err(|e| format!("MOCHI_API_KEY: {e}"))?;
        if api_key.trim().is_empty() {
            return Err("MOCHI_API_KEY is empty".into());
        }
        let base_url = env::var("MOCHI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self { api_key, base_url })
    }
}

pub struct MochiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl MochiClient {
    pub fn new(config: MochiConfig) -> Self {
        let mut base_url = config.base_url;
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            http: reqwest::Client::new(),
            api_key: config.api_key,
            base_url,
        }
    }

    pub fn new_from_env() -> Result<Self, ClientError> {
        dotenvy::dotenv().ok();
        Ok(Self::new(MochiConfig::from_env()?))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path.trim_start_matches('/'));
        debug!(%method, url = %url, "[CLIENT] Request");
        self.http
            .request(method, url)
            .basic_auth(&self.api_key, Some(""))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        let text = resp
            .text()
            .await
            .unwrap_or_else(|_| String::from("<Failed to decode response body>"));
        error!(status = %status, url = %url, "[CLIENT] Mochi API returned error. Response body: {text}");
        Err(format!("Mochi API error: {status} for {url}: {text}").into())
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ClientError> {
        let resp = self.send(builder).await?;
        Ok(resp.json::<T>().await?)
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    docs: Vec<T>,
    #[serde(default)]
    bookmark: Option<String>,
}

impl<T> ListResponse<T> {
    fn into_page<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.docs.into_iter().map(f).collect(),
            bookmark: self.bookmark,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireDeck {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "parent-id", default)]
    parent_id: Option<String>,
    #[serde(rename = "archived?", default)]
    archived: bool,
}

impl From<WireDeck> for Deck {
    fn from(d: WireDeck) -> Self {
        Deck {
            id: d.id,
            name: d.name,
            parent_id: d.parent_id,
            archived: d.archived,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireNewDeck<'a> {
    name: &'a str,
    #[serde(rename = "parent-id", skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireField {
    id: String,
    #[serde(default)]
    value: String,
}

fn wire_fields(fields: BTreeMap<String, String>) -> BTreeMap<String, WireField> {
    fields
        .into_iter()
        .map(|(id, value)| (id.clone(), WireField { id, value }))
        .collect()
}

#[derive(Debug, Deserialize)]
struct WireCard {
    id: String,
    #[serde(rename = "deck-id")]
    deck_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    fields: BTreeMap<String, WireField>,
    #[serde(default)]
    pos: Option<String>,
    #[serde(rename = "template-id", default)]
    template_id: Option<String>,
    #[serde(rename = "archived?", default)]
    archived: bool,
}

impl From<WireCard> for Card {
    fn from(c: WireCard) -> Self {
        Card {
            id: c.id,
            deck_id: c.deck_id,
            name: c.name,
            content: c.content,
            fields: c.fields.into_iter().map(|(id, f)| (id, f.value)).collect(),
            pos: c.pos,
            template_id: c.template_id,
            archived: c.archived,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireNewCard {
    #[serde(rename = "deck-id")]
    deck_id: String,
    name: String,
    content: String,
    #[serde(rename = "template-id", skip_serializing_if = "Option::is_none")]
    template_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    fields: BTreeMap<String, WireField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pos: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireCardUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<BTreeMap<String, WireField>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pos: Option<String>,
    #[serde(rename = "archived?", skip_serializing_if = "Option::is_none")]
    archived: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct WireTemplateField {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    pos: String,
}

#[derive(Debug, Deserialize)]
struct WireTemplate {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    fields: BTreeMap<String, WireTemplateField>,
}

impl From<WireTemplate> for Template {
    fn from(t: WireTemplate) -> Self {
        Template {
            id: t.id,
            name: t.name,
            fields: t
                .fields
                .into_values()
                .map(|f| {
                    (
                        f.id.clone(),
                        TemplateField {
                            id: f.id,
                            name: f.name,
                            pos: f.pos,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Client for MochiClient {
    async fn create_deck(&self, req: NewDeck) -> Result<Deck, ClientError> {
        let body = WireNewDeck {
            name: &req.name,
            parent_id: req.parent_id.as_deref(),
        };
        let deck: WireDeck = self.json(self.request(Method::POST, "decks/").json(&body)).await?;
        Ok(deck.into())
    }

    async fn update_deck(&self, deck_id: String, name: String) -> Result<Deck, ClientError> {
        let body = WireNewDeck {
            name: &name,
            parent_id: None,
        };
        let path = format!("decks/{deck_id}");
        let deck: WireDeck = self.json(self.request(Method::POST, &path).json(&body)).await?;
        Ok(deck.into())
    }

    async fn list_decks_page(&self, bookmark: Option<String>) -> Result<Page<Deck>, ClientError> {
        let mut builder = self.request(Method::GET, "decks/");
        if let Some(bookmark) = &bookmark {
            builder = builder.query(&[("bookmark", bookmark)]);
        }
        let page: ListResponse<WireDeck> = self.json(builder).await?;
        Ok(page.into_page(Deck::from))
    }

    async fn delete_deck(&self, deck_id: String) -> Result<(), ClientError> {
        self.send(self.request(Method::DELETE, &format!("decks/{deck_id}")))
            .await?;
        Ok(())
    }

    async fn create_card(&self, req: NewCard) -> Result<Card, ClientError> {
        let body = WireNewCard {
            deck_id: req.deck_id,
            name: req.name,
            content: req.content,
            template_id: req.template_id,
            fields: wire_fields(req.fields),
            pos: req.pos,
        };
        let card: WireCard = self.json(self.request(Method::POST, "cards/").json(&body)).await?;
        Ok(card.into())
    }

    async fn update_card(&self, card_id: String, update: CardUpdate) -> Result<Card, ClientError> {
        let body = WireCardUpdate {
            content: update.content,
            fields: update.fields.map(wire_fields),
            pos: update.pos,
            archived: update.archived,
        };
        let path = format!("cards/{card_id}");
        let card: WireCard = self.json(self.request(Method::POST, &path).json(&body)).await?;
        Ok(card.into())
    }

    async fn list_cards_page(
        &self,
        deck_id: String,
        bookmark: Option<String>,
    ) -> Result<Page<Card>, ClientError> {
        let mut query = vec![("deck-id", deck_id)];
        if let Some(bookmark) = bookmark {
            query.push(("bookmark", bookmark));
        }
        let builder = self.request(Method::GET, "cards/").query(&query);
        let page: ListResponse<WireCard> = self.json(builder).await?;
        Ok(page.into_page(Card::from))
    }

    async fn delete_card(&self, card_id: String) -> Result<(), ClientError> {
        self.send(self.request(Method::DELETE, &format!("cards/{card_id}")))
            .await?;
        Ok(())
    }

    async fn add_attachment(
        &self,
        card_id: String,
        name: String,
        data: Vec<u8>,
    ) -> Result<(), ClientError> {
        let part = reqwest::multipart::Part::bytes(data).file_name(name.clone());
        let form = reqwest::multipart::Form::new().part("file", part);
        let path = format!("cards/{card_id}/attachments/{name}");
        self.send(self.request(Method::POST, &path).multipart(form))
            .await?;
        Ok(())
    }

    async fn list_templates(&self) -> Result<Vec<Template>, ClientError> {
        let mut templates = Vec::new();
        let mut bookmark: Option<String> = None;
        loop {
            let mut builder = self.request(Method::GET, "templates/");
            if let Some(bookmark) = &bookmark {
                builder = builder.query(&[("bookmark", bookmark)]);
            }
            let page: ListResponse<WireTemplate> = self.json(builder).await?;
            let page = page.into_page(Template::from);
            let next = next_bookmark(&page, bookmark.as_deref());
            templates.extend(page.items);
            match next {
                Some(next) => bookmark = Some(next),
                None => break,
            }
        }
        Ok(templates)
    }
}
