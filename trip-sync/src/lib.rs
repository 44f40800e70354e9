//! Client-side data synchronization for the trip planner.
//!
//! [`TripSync`] is the context object every read and write goes through. It bundles the remote
//! backend, the query cache, the UI filter store and the session, and is cheap to clone: clones
//! share all of them.
//!
//! - Reads ([`TripSync::locations`], [`TripSync::directions`], [`TripSync::tags`], ...) go
//!   through the cache, keyed as in [`keys`].
//! - Writes are optimistic where the UI needs them to be and invalidate the affected cache
//!   entries once the backend confirms.
//! - [`TripSync::watch_locations`] keeps cached location pages in step with changes made by
//!   anyone, by patching them from the realtime feed.

mod config;
mod destinations;
mod error;
mod favourites;
pub mod filter_state;
mod images;
pub mod keys;
mod locations;
pub mod models;
mod mutation;
mod notices;
pub mod persistence;
pub mod search;
pub mod session;
mod synchronizer;
mod tags;

pub use config::SyncConfig;
pub use error::SyncError;
pub use filter_state::{FilterState, UiStore};
pub use notices::{Notice, NoticeLevel};
pub use search::SearchDebouncer;
pub use session::{AuthStatus, SessionProvider, User, UsernameSession};
pub use synchronizer::{LocationFeed, LocationFilter, LocationPage};

use std::rc::Rc;

use chokepoint::{QueryCache, Spawner};
use supaclient::Backend;

use notices::Notices;

pub struct TripSync<B> {
    backend: Rc<B>,
    cache: QueryCache<SyncError>,
    store: UiStore,
    session: Rc<dyn SessionProvider>,
    config: Rc<SyncConfig>,
    notices: Notices,
}

impl<B> Clone for TripSync<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            session: self.session.clone(),
            config: self.config.clone(),
            notices: self.notices.clone(),
        }
    }
}

impl<B: Backend + 'static> TripSync<B> {
    pub fn new(
        backend: Rc<B>,
        session: Rc<dyn SessionProvider>,
        store: UiStore,
        config: SyncConfig,
        spawner: Spawner,
    ) -> Self {
        Self::with_cache(backend, session, store, config, QueryCache::new(spawner))
    }

    /// Like [`TripSync::new`] with a cache built by the caller, e.g. one with its own clock.
    pub fn with_cache(
        backend: Rc<B>,
        session: Rc<dyn SessionProvider>,
        store: UiStore,
        config: SyncConfig,
        cache: QueryCache<SyncError>,
    ) -> Self {
        Self {
            backend,
            cache,
            store,
            session,
            config: Rc::new(config),
            notices: Notices::default(),
        }
    }

    pub fn backend(&self) -> &Rc<B> {
        &self.backend
    }

    pub fn cache(&self) -> &QueryCache<SyncError> {
        &self.cache
    }

    pub fn store(&self) -> &UiStore {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// A debouncer for the search box, committing to this context's store after the configured
    /// quiet period.
    pub fn search_debouncer(&self) -> SearchDebouncer {
        SearchDebouncer::new(self.store.clone(), self.config.search_debounce())
    }

    /// Messages for the user queued since the last call.
    pub fn drain_notices(&self) -> Vec<Notice> {
        self.notices.drain()
    }

    fn require_user(&self) -> Result<User, SyncError> {
        self.session
            .current_user()
            .ok_or(SyncError::NotAuthenticated)
    }

    /// Queues a notice for the outcome of a user action. Sign-in prompts are not notices.
    fn report<T>(&self, result: Result<T, SyncError>, success: &str, failure: &str) -> Result<T, SyncError> {
        match &result {
            Ok(_) => self.notices.success(success),
            Err(SyncError::AuthRequired) => {}
            Err(e) => self.notices.error(format!("{failure}: {e}")),
        }
        result
    }
}
