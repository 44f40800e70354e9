use std::rc::Rc;

use serde_json::Value;

use crate::{Filter, RemoteError, Row, RowQuery};

/// Table access and remote procedures.
///
/// Every write returns the affected rows as the backend stored them, with generated columns
/// (`id`, `created_at`) filled in.
pub trait RemoteDataService {
    fn select(&self, query: RowQuery) -> impl Future<Output = Result<Vec<Row>, RemoteError>>;

    fn insert(
        &self,
        table: &str,
        rows: Vec<Row>,
    ) -> impl Future<Output = Result<Vec<Row>, RemoteError>>;

    /// Inserts `rows`, overwriting any row that collides with one of them on a unique key.
    fn upsert(
        &self,
        table: &str,
        rows: Vec<Row>,
    ) -> impl Future<Output = Result<Vec<Row>, RemoteError>>;

    fn update(
        &self,
        table: &str,
        patch: Row,
        filters: Vec<Filter>,
    ) -> impl Future<Output = Result<Vec<Row>, RemoteError>>;

    fn delete(
        &self,
        table: &str,
        filters: Vec<Filter>,
    ) -> impl Future<Output = Result<Vec<Row>, RemoteError>>;

    /// Calls a server-side procedure. Procedures run in one transaction.
    fn rpc(&self, name: &str, params: Value) -> impl Future<Output = Result<Value, RemoteError>>;
}

pub trait BlobStore {
    fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> impl Future<Output = Result<(), RemoteError>>;

    fn public_url(&self, path: &str) -> String;

    /// Inverse of [`BlobStore::public_url`].
    fn path_from_public_url(&self, url: &str) -> Option<String>;

    fn remove(&self, paths: Vec<String>) -> impl Future<Output = Result<(), RemoteError>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub new: Option<Row>,
    pub old: Option<Row>,
}

impl ChangeEvent {
    /// The `id` of the changed row, taken from the new record when there is one.
    pub fn record_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .and_then(|row| row.get("id"))
            .or_else(|| self.old.as_ref().and_then(|row| row.get("id")))
            .and_then(Value::as_str)
    }
}

pub type ChangeHandler = Rc<dyn Fn(&ChangeEvent)>;

/// Keeps a realtime subscription open. Dropping it unsubscribes.
pub struct Subscription {
    teardown: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(teardown: impl FnOnce() + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn detached() -> Self {
        Self { teardown: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.teardown.is_some())
            .finish()
    }
}

pub trait RealtimeFeed {
    /// Delivers every committed change to `table` to `handler` until the subscription is dropped.
    fn subscribe(&self, table: &str, handler: ChangeHandler) -> Result<Subscription, RemoteError>;
}

/// Everything the sync layer needs from a backend.
pub trait Backend: RemoteDataService + BlobStore + RealtimeFeed {}

impl<T: RemoteDataService + BlobStore + RealtimeFeed> Backend for T {}

/// Extracts the object path from a public storage URL of `bucket`.
///
/// `https://x.supabase.co/storage/v1/object/public/images/alice/1-abc.jpg` gives
/// `alice/1-abc.jpg`.
pub fn storage_path_from_url(url: &str, bucket: &str) -> Option<String> {
    let marker = format!("/storage/v1/object/public/{bucket}/");
    let start = url.find(&marker)? + marker.len();
    let path = url[start..].split(['?', '#']).next().unwrap_or_default();
    (!path.is_empty()).then(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn test_storage_path_from_url() {
        assert_eq!(
            storage_path_from_url(
                "https://x.supabase.co/storage/v1/object/public/images/alice/17-abc123.jpg?t=1",
                "images"
            ),
            Some("alice/17-abc123.jpg".to_string())
        );
        assert_eq!(
            storage_path_from_url("https://cdn.example.com/alice.jpg", "images"),
            None
        );
        assert_eq!(
            storage_path_from_url("https://x.supabase.co/storage/v1/object/public/images/", "images"),
            None
        );
    }

    #[test]
    fn test_record_id_prefers_new_row() {
        let event = ChangeEvent {
            table: "locations".into(),
            kind: ChangeKind::Delete,
            new: None,
            old: json!({"id": "loc-1"}).as_object().cloned(),
        };
        assert_eq!(event.record_id(), Some("loc-1"));
    }

    #[test]
    fn test_subscription_tears_down_once() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let subscription = Subscription::new(move || counter.set(counter.get() + 1));
        subscription.unsubscribe();
        assert_eq!(calls.get(), 1);

        let counter = calls.clone();
        drop(Subscription::new(move || counter.set(counter.get() + 1)));
        assert_eq!(calls.get(), 2);
    }
}
