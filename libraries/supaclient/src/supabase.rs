//! PostgREST and Storage over HTTP.
use std::cell::RefCell;

use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;

use crate::{
    BlobStore, ChangeHandler, Filter, RealtimeFeed, RemoteDataService, RemoteError, Row, RowQuery,
    Subscription, storage_path_from_url,
};

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SupabaseConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub bucket: String,
}

impl SupabaseConfig {
    /// Reads `SUPABASE_URL`, `SUPABASE_ANON_KEY` and optionally `SUPABASE_BUCKET` (default
    /// `images`).
    pub fn from_env() -> Result<Self, RemoteError> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| RemoteError::Config(format!("{name} is not set")))
        };
        Ok(Self {
            supabase_url: var("SUPABASE_URL")?.trim_end_matches('/').to_string(),
            supabase_anon_key: var("SUPABASE_ANON_KEY")?,
            bucket: var("SUPABASE_BUCKET").unwrap_or_else(|_| "images".to_string()),
        })
    }
}

/// PostgREST error body.
#[derive(serde::Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

pub struct SupabaseClient {
    config: SupabaseConfig,
    client: Client,
    access_token: RefCell<Option<String>>,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            access_token: RefCell::new(None),
        }
    }

    /// Sends `token` instead of the anon key from now on. `None` goes back to the anon key.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.borrow_mut() = token;
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .access_token
            .borrow()
            .clone()
            .unwrap_or_else(|| self.config.supabase_anon_key.clone());
        request
            .header("apikey", &self.config.supabase_anon_key)
            .header("Authorization", format!("Bearer {bearer}"))
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.config.supabase_url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let error = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => RemoteError::Http {
                status,
                code: body.code,
                message: body.message.or(body.error).unwrap_or(text),
            },
            Err(_) => RemoteError::Http {
                status,
                code: None,
                message: text,
            },
        };
        log::warn!("Supabase request failed: {error}");
        Err(error)
    }

    async fn rows(&self, request: RequestBuilder) -> Result<Vec<Row>, RemoteError> {
        self.send(request)
            .await?
            .json::<Vec<Row>>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(Filter::to_postgrest).collect()
}

impl RemoteDataService for SupabaseClient {
    async fn select(&self, query: RowQuery) -> Result<Vec<Row>, RemoteError> {
        let request = self
            .client
            .get(self.table_url(&query.table))
            .query(&query.to_postgrest_params());
        self.rows(request).await
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, RemoteError> {
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&rows);
        self.rows(request).await
    }

    async fn upsert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, RemoteError> {
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation,resolution=merge-duplicates")
            .json(&rows);
        self.rows(request).await
    }

    async fn update(
        &self,
        table: &str,
        patch: Row,
        filters: Vec<Filter>,
    ) -> Result<Vec<Row>, RemoteError> {
        let request = self
            .client
            .patch(self.table_url(table))
            .query(&filter_params(&filters))
            .header("Prefer", "return=representation")
            .json(&patch);
        self.rows(request).await
    }

    async fn delete(&self, table: &str, filters: Vec<Filter>) -> Result<Vec<Row>, RemoteError> {
        let request = self
            .client
            .delete(self.table_url(table))
            .query(&filter_params(&filters))
            .header("Prefer", "return=representation");
        self.rows(request).await
    }

    async fn rpc(&self, name: &str, params: Value) -> Result<Value, RemoteError> {
        let url = format!("{}/rest/v1/rpc/{name}", self.config.supabase_url);
        let response = self.send(self.client.post(url).json(&params)).await?;
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

impl BlobStore for SupabaseClient {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), RemoteError> {
        let url = format!(
            "{}/storage/v1/object/{}/{path}",
            self.config.supabase_url, self.config.bucket
        );
        let request = self
            .client
            .post(url)
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes);
        self.send(request).await?;
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{path}",
            self.config.supabase_url, self.config.bucket
        )
    }

    fn path_from_public_url(&self, url: &str) -> Option<String> {
        storage_path_from_url(url, &self.config.bucket)
    }

    async fn remove(&self, paths: Vec<String>) -> Result<(), RemoteError> {
        let url = format!(
            "{}/storage/v1/object/{}",
            self.config.supabase_url, self.config.bucket
        );
        let request = self
            .client
            .delete(url)
            .json(&serde_json::json!({ "prefixes": paths }));
        self.send(request).await?;
        Ok(())
    }
}

impl RealtimeFeed for SupabaseClient {
    fn subscribe(&self, table: &str, _handler: ChangeHandler) -> Result<Subscription, RemoteError> {
        Err(RemoteError::Realtime(format!(
            "no websocket transport for `{table}` in the REST client"
        )))
    }
}
