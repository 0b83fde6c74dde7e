//! Pocket v3 API client.
//!
//! One [`PocketClient`] is built per run and shared (behind an `Arc`) by the
//! retriever, the archive step, and the section renderer that needs the
//! per-item action links. It implements:
//!
//! * [`CollectionSource`] — `POST /v3/get` with `state=unread`,
//!   `detailType=complete`, `favorite=0`, paginated by `offset`/`count`;
//! * [`Archiver`] — `POST /v3/send` with one `archive` action per item id.
//!
//! Pocket answers an empty listing with `"list": []` instead of an object,
//! so the list field is decoded from either shape.

use crate::error::P2kError;
use crate::model::{ItemId, ReadState, RemoteItem};
use crate::pipeline::retrieve::CollectionSource;
use crate::run::Archiver;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const API_BASE: &str = "https://getpocket.com/v3";

/// Environment variable holding the application consumer key.
pub const CONSUMER_KEY_ENV: &str = "POCKET_CONSUMER_KEY";
/// Environment variable holding the user access token.
pub const ACCESS_TOKEN_ENV: &str = "POCKET_REQUEST_TOKEN";

/// Read a required, non-empty environment variable.
pub fn require_env(var: &str) -> Result<String, P2kError> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(P2kError::MissingEnv {
            var: var.to_string(),
        }),
    }
}

/// Explicit Pocket client, constructed once per run.
#[derive(Clone)]
pub struct PocketClient {
    http: reqwest::Client,
    consumer_key: String,
    access_token: String,
    api_base: String,
}

impl std::fmt::Debug for PocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PocketClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl PocketClient {
    pub fn new(
        consumer_key: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self, P2kError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| P2kError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            consumer_key: consumer_key.into(),
            access_token: access_token.into(),
            api_base: API_BASE.to_string(),
        })
    }

    /// Build a client from `POCKET_CONSUMER_KEY` and `POCKET_REQUEST_TOKEN`.
    pub fn from_env() -> Result<Self, P2kError> {
        let key = require_env(CONSUMER_KEY_ENV)?;
        let token = require_env(ACCESS_TOKEN_ENV)?;
        Self::new(key, token)
    }

    /// Point the client at another API root (self-hosted proxies, tests).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// One-click `GET /v3/send` link performing `action` on `id`.
    ///
    /// The link carries the credentials, exactly like the Pocket web links;
    /// the book should only be delivered to its owner.
    pub fn action_url(&self, action: &str, id: &ItemId) -> Option<String> {
        let actions = serde_json::to_string(&[SendAction::new(action, id)]).ok()?;
        let url = Url::parse_with_params(
            &format!("{}/send", self.api_base),
            &[
                ("actions", actions.as_str()),
                ("access_token", self.access_token.as_str()),
                ("consumer_key", self.consumer_key.as_str()),
            ],
        )
        .ok()?;
        Some(url.to_string())
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<R, P2kError> {
        let url = format!("{}/{}", self.api_base, endpoint);
        let response = self
            .http
            .post(&url)
            .header("X-Accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| P2kError::RemoteRequest {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .headers()
                .get("X-Error")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(P2kError::RemoteRejected {
                endpoint: endpoint.to_string(),
                reason: format!("HTTP {status} {detail}").trim_end().to_string(),
            });
        }

        response.json::<R>().await.map_err(|e| P2kError::RemoteRequest {
            endpoint: endpoint.to_string(),
            reason: format!("invalid response body: {e}"),
        })
    }
}

#[async_trait]
impl CollectionSource for PocketClient {
    async fn fetch_page(
        &self,
        offset: usize,
        count: usize,
    ) -> Result<Option<Vec<RemoteItem>>, P2kError> {
        let request = RetrieveRequest {
            consumer_key: &self.consumer_key,
            access_token: &self.access_token,
            state: "unread",
            favorite: "0",
            detail_type: "complete",
            sort: "newest",
            offset,
            count,
        };
        let response: RetrieveResponse = self.post("get", &request).await?;
        let items = response.list.into_items();
        debug!("Pocket page at offset {} returned {} items", offset, items.len());
        // The listing is treated as unbounded: an empty page is not an end marker.
        Ok(Some(items))
    }

    fn item_actions(&self, id: &ItemId) -> Vec<(String, String)> {
        ["favorite", "archive"]
            .iter()
            .filter_map(|action| {
                let label = if *action == "favorite" { "Favorite" } else { "Archive" };
                self.action_url(action, id).map(|u| (label.to_string(), u))
            })
            .collect()
    }
}

#[async_trait]
impl Archiver for PocketClient {
    async fn archive(&self, ids: &[ItemId]) -> Result<(), P2kError> {
        if ids.is_empty() {
            return Ok(());
        }
        let actions: Vec<SendAction<'_>> =
            ids.iter().map(|id| SendAction::new("archive", id)).collect();
        let request = SendRequest {
            consumer_key: &self.consumer_key,
            access_token: &self.access_token,
            actions,
        };
        let response: SendResponse = self.post("send", &request).await?;
        if response.status != 1 {
            return Err(P2kError::RemoteRejected {
                endpoint: "send".into(),
                reason: format!("status {}", response.status),
            });
        }
        let failed = response.action_results.iter().filter(|ok| !**ok).count();
        if failed > 0 {
            return Err(P2kError::RemoteRejected {
                endpoint: "send".into(),
                reason: format!("{failed}/{} archive actions failed", ids.len()),
            });
        }
        info!("Archived {} items", ids.len());
        Ok(())
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RetrieveRequest<'a> {
    consumer_key: &'a str,
    access_token: &'a str,
    state: &'a str,
    favorite: &'a str,
    #[serde(rename = "detailType")]
    detail_type: &'a str,
    sort: &'a str,
    offset: usize,
    count: usize,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    list: ItemList,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ItemList {
    Map(HashMap<String, PocketItem>),
    Empty(Vec<serde_json::Value>),
}

impl Default for ItemList {
    fn default() -> Self {
        ItemList::Empty(Vec::new())
    }
}

impl ItemList {
    fn into_items(self) -> Vec<RemoteItem> {
        match self {
            ItemList::Empty(_) => Vec::new(),
            ItemList::Map(map) => {
                let mut items: Vec<PocketItem> = map.into_values().collect();
                items.sort_by_key(|i| i.sort_id.unwrap_or(u64::MAX));
                items.into_iter().map(PocketItem::into_remote).collect()
            }
        }
    }
}

#[derive(Deserialize)]
struct PocketItem {
    item_id: String,
    #[serde(default)]
    resolved_url: Option<String>,
    #[serde(default)]
    given_url: Option<String>,
    #[serde(default)]
    resolved_title: Option<String>,
    #[serde(default)]
    given_title: Option<String>,
    #[serde(default)]
    favorite: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    sort_id: Option<u64>,
}

impl PocketItem {
    fn into_remote(self) -> RemoteItem {
        let non_empty = |s: Option<String>| s.filter(|v| !v.trim().is_empty());
        let url = non_empty(self.resolved_url)
            .or(non_empty(self.given_url))
            .unwrap_or_default();
        let title = non_empty(self.resolved_title)
            .or(non_empty(self.given_title))
            .unwrap_or_else(|| url.clone());
        let state = match self.status.as_deref() {
            Some("1") => ReadState::Archived,
            Some("2") => ReadState::Deleted,
            _ => ReadState::Unread,
        };
        RemoteItem {
            id: ItemId(self.item_id),
            url,
            title,
            favorite: self.favorite.as_deref() == Some("1"),
            state,
        }
    }
}

#[derive(Serialize)]
struct SendAction<'a> {
    action: &'a str,
    item_id: &'a str,
    time: String,
}

impl<'a> SendAction<'a> {
    fn new(action: &'a str, id: &'a ItemId) -> Self {
        Self {
            action,
            item_id: &id.0,
            time: chrono::Utc::now().timestamp().to_string(),
        }
    }
}

#[derive(Serialize)]
struct SendRequest<'a> {
    consumer_key: &'a str,
    access_token: &'a str,
    actions: Vec<SendAction<'a>>,
}

#[derive(Deserialize)]
struct SendResponse {
    status: i64,
    #[serde(default)]
    action_results: Vec<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_listing_object() {
        let body = r#"{
            "status": 1,
            "complete": 1,
            "list": {
                "22": {"item_id": "22", "resolved_url": "https://b.example/2",
                       "resolved_title": "Second", "favorite": "0", "status": "0", "sort_id": 1},
                "11": {"item_id": "11", "given_url": "https://a.example/1",
                       "resolved_url": "", "given_title": "First", "favorite": "1",
                       "status": "0", "sort_id": 0}
            }
        }"#;
        let response: RetrieveResponse = serde_json::from_str(body).unwrap();
        let items = response.list.into_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, ItemId::from("11"));
        assert_eq!(items[0].url, "https://a.example/1");
        assert_eq!(items[0].title, "First");
        assert!(items[0].favorite);
        assert_eq!(items[1].title, "Second");
        assert_eq!(items[1].state, ReadState::Unread);
    }

    #[test]
    fn decode_empty_listing_array() {
        let body = r#"{"status": 2, "complete": 1, "list": []}"#;
        let response: RetrieveResponse = serde_json::from_str(body).unwrap();
        assert!(response.list.into_items().is_empty());
    }

    #[test]
    fn action_url_carries_encoded_action() {
        let client = PocketClient::new("key", "token").unwrap();
        let url = client.action_url("favorite", &ItemId::from("42")).unwrap();
        assert!(url.starts_with("https://getpocket.com/v3/send?actions="));
        assert!(url.contains("consumer_key=key"));
        assert!(url.contains("access_token=token"));
        let parsed = Url::parse(&url).unwrap();
        let actions = parsed
            .query_pairs()
            .find(|(k, _)| k == "actions")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let decoded: serde_json::Value = serde_json::from_str(&actions).unwrap();
        assert_eq!(decoded[0]["action"], "favorite");
        assert_eq!(decoded[0]["item_id"], "42");
    }

    #[test]
    fn item_actions_lists_favorite_and_archive() {
        let client = PocketClient::new("key", "token").unwrap();
        let actions = client.item_actions(&ItemId::from("7"));
        let labels: Vec<&str> = actions.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["Favorite", "Archive"]);
    }

    #[test]
    fn send_response_decodes() {
        let r: SendResponse =
            serde_json::from_str(r#"{"status": 1, "action_results": [true, false]}"#).unwrap();
        assert_eq!(r.status, 1);
        assert_eq!(r.action_results, vec![true, false]);
    }
}
