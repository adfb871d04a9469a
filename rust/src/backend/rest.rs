//! PostgREST-style HTTP backend with storage and a realtime change feed.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use flume::Sender;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use super::realtime::RealtimeClient;
use super::{
    Backend, BackendError, ChangeEvent, ChangeFilter, ColumnEq, Identity, Predicate, Select,
    SubscriptionHandle,
};

const RESERVED: &[char] = &[',', '(', ')', '.', ':', '"'];

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(rename = "Key", default)]
    key: Option<String>,
}

pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    access_token: RwLock<Option<String>>,
    realtime: RealtimeClient,
}

impl RestBackend {
    pub fn new(
        base_url: impl Into<String>,
        anon_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(BackendError::Unavailable("backend URL cannot be empty".into()));
        }
        let anon_key = anon_key.into();
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            realtime: RealtimeClient::new(&base_url, &anon_key)?,
            client,
            base_url,
            anon_key,
            access_token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn token(&self) -> Option<String> {
        match self.access_token.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let bearer = self.token().unwrap_or_else(|| self.anon_key.clone());
        builder.header("apikey", &self.anon_key).bearer_auth(bearer)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let resp = self.request(builder).send().await.map_err(transport)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
    ) -> Result<T, BackendError> {
        let bytes = resp.bytes().await.map_err(transport)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn transport(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Transport(e)
    }
}

fn quote(value: &str) -> String {
    if value.contains(RESERVED) {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

fn nested_eq(eq: &ColumnEq) -> String {
    format!("{}.eq.{}", eq.column, quote(&eq.value))
}

/// Query-string filters for a predicate, in PostgREST syntax.
pub(crate) fn filter_pairs(predicate: &Predicate) -> Vec<(String, String)> {
    match predicate.any_of.as_slice() {
        [] => vec![],
        [only] => only
            .iter()
            .map(|eq| (eq.column.clone(), format!("eq.{}", eq.value)))
            .collect(),
        clauses => {
            let parts: Vec<String> = clauses
                .iter()
                .map(|clause| match clause.as_slice() {
                    [single] => nested_eq(single),
                    many => format!(
                        "and({})",
                        many.iter().map(nested_eq).collect::<Vec<_>>().join(",")
                    ),
                })
                .collect();
            vec![("or".to_string(), format!("({})", parts.join(",")))]
        }
    }
}

pub(crate) fn query_pairs(query: &Select) -> Vec<(String, String)> {
    let mut pairs = vec![("select".to_string(), "*".to_string())];
    pairs.extend(filter_pairs(&query.predicate));
    if let Some(order) = &query.order {
        let dir = if order.ascending { "asc" } else { "desc" };
        pairs.push(("order".to_string(), format!("{}.{dir}", order.column)));
    }
    if let Some(limit) = query.limit {
        pairs.push(("limit".to_string(), limit.to_string()));
    }
    pairs
}

#[async_trait]
impl Backend for RestBackend {
    async fn current_identity(&self) -> Result<Option<Identity>, BackendError> {
        if self.token().is_none() {
            return Ok(None);
        }
        let url = format!("{}/auth/v1/user", self.base_url);
        match self.send(self.client.get(url)).await {
            Ok(resp) => {
                let user: UserResponse = Self::decode(resp).await?;
                Ok(Some(Identity {
                    id: user.id,
                    email: user.email,
                }))
            }
            Err(BackendError::Http { status, .. })
                if status == StatusCode::UNAUTHORIZED.as_u16()
                    || status == StatusCode::FORBIDDEN.as_u16() =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn set_access_token(&self, token: Option<String>) {
        match self.access_token.write() {
            Ok(mut g) => *g = token,
            Err(poison) => *poison.into_inner() = token,
        }
    }

    async fn select(&self, query: Select) -> Result<Vec<Value>, BackendError> {
        let builder = self
            .client
            .get(self.table_url(&query.table))
            .query(&query_pairs(&query));
        let resp = self.send(builder).await?;
        Self::decode(resp).await
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError> {
        let builder = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&row);
        let resp = self.send(builder).await?;
        let rows: Vec<Value> = Self::decode(resp).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::Unavailable(format!("insert into {table} returned no row")))
    }

    async fn update(
        &self,
        table: &str,
        predicate: &Predicate,
        patch: Value,
    ) -> Result<Vec<Value>, BackendError> {
        let builder = self
            .client
            .patch(self.table_url(table))
            .query(&filter_pairs(predicate))
            .header("Prefer", "return=representation")
            .json(&patch);
        let resp = self.send(builder).await?;
        Self::decode(resp).await
    }

    async fn subscribe(
        &self,
        table: &str,
        filter: ChangeFilter,
        sink: Sender<ChangeEvent>,
    ) -> Result<SubscriptionHandle, BackendError> {
        self.realtime
            .subscribe(table, filter, self.token(), sink)
            .await
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.realtime.unsubscribe(handle);
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError> {
        let url = format!("{}/storage/v1/object/{bucket}/{path}", self.base_url);
        let builder = self
            .client
            .post(url)
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes);
        let resp = self.send(builder).await?;
        let uploaded: UploadResponse = Self::decode(resp).await?;
        tracing::debug!(key = ?uploaded.key, "storage: uploaded");
        Ok(path.to_string())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{bucket}/{path}",
            self.base_url
        )
    }
}
