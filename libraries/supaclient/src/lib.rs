//! Client-side contract for a PostgREST-style backend: row queries, transactional remote
//! procedures, a blob store and a realtime change feed.
//!
//! Two implementations ship with the crate:
//! - [`memory::MemoryBackend`], an in-process relational store with the trip planner's tables and
//!   procedures, used by tests and demos;
//! - `supabase::SupabaseClient` (feature `supabase`), which talks to a Supabase project over HTTP.

mod error;
pub mod memory;
mod query;
mod service;

#[cfg(feature = "supabase")]
pub mod supabase;

pub use error::{RemoteError, UNIQUE_VIOLATION};
pub use query::{Filter, Order, RowQuery, compare_values, values_equal};
pub use service::{
    Backend, BlobStore, ChangeEvent, ChangeHandler, ChangeKind, RealtimeFeed, RemoteDataService,
    Subscription, storage_path_from_url,
};

/// A table row as returned by the backend.
pub type Row = serde_json::Map<String, serde_json::Value>;
