#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use chokepoint::QueryCache;
use chrono::{DateTime, TimeDelta, Utc};
use futures::executor::LocalPool;
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;
use serde_json::{Value, json};
use supaclient::memory::MemoryBackend;
use supaclient::{RemoteDataService, RemoteError, Row};
use trip_sync::models::{ImageFile, Location};
use trip_sync::{SyncConfig, TripSync, UiStore, UsernameSession};

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

pub fn server_error() -> RemoteError {
    RemoteError::Http {
        status: 500,
        code: None,
        message: "internal error".into(),
    }
}

pub fn png(name: &str) -> ImageFile {
    ImageFile {
        name: name.into(),
        content_type: "image/png".into(),
        bytes: b"\x89PNG\r\n".to_vec(),
    }
}

/// A sync context over an in-memory backend, driven by a local pool, with a clock tests move by
/// hand.
pub struct Harness {
    pool: RefCell<LocalPool>,
    pub backend: Rc<MemoryBackend>,
    pub session: Rc<UsernameSession<MemoryBackend>>,
    pub sync: TripSync<MemoryBackend>,
    now: Rc<Cell<DateTime<Utc>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        let now = Rc::new(Cell::new(Utc::now()));
        let clock_now = now.clone();
        let cache = QueryCache::with_clock(
            Rc::new(move |fut: LocalBoxFuture<'static, ()>| {
                spawner
                    .spawn_local(fut)
                    .expect("local pool accepts tasks");
            }),
            Rc::new(move || clock_now.get()),
        );

        let backend = Rc::new(MemoryBackend::new());
        let session = Rc::new(UsernameSession::new(backend.clone()));
        let sync = TripSync::with_cache(
            backend.clone(),
            session.clone(),
            UiStore::new(),
            config,
            cache,
        );
        Self {
            pool: RefCell::new(pool),
            backend,
            session,
            sync,
            now,
        }
    }

    /// A harness with `user` signed in.
    pub fn signed_in(user: &str) -> Self {
        let h = Self::new();
        h.run(h.session.sign_in(user)).unwrap();
        h
    }

    pub fn run<T>(&self, fut: impl Future<Output = T>) -> T {
        self.pool.borrow_mut().run_until(fut)
    }

    pub fn advance(&self, by: TimeDelta) {
        self.now.set(self.now.get() + by);
    }

    pub fn seed_direction(&self, id: &str, owner: &str) {
        self.backend
            .seed(
                "directions",
                vec![row(json!({
                    "id": id,
                    "user_id": owner,
                    "title": id,
                    "country": "Georgia",
                    "cover_url": format!("http://localhost:54321/storage/v1/object/public/images/{owner}/{id}.png"),
                }))],
            )
            .unwrap();
    }

    /// Creates a location the way another client would, straight through the backend.
    pub fn add_spot(&self, direction: &str, title: &str, tags: &[&str]) -> Location {
        let created = self
            .run(self.backend.rpc(
                "create_location_with_tags",
                json!({
                    "p_user_id": "alice",
                    "p_direction_id": direction,
                    "p_title": title,
                    "p_tags": tags,
                }),
            ))
            .unwrap();
        serde_json::from_value(created).unwrap()
    }

    /// Backend operations issued while running `fut`.
    pub fn calls_during<T>(&self, fut: impl Future<Output = T>) -> (T, Vec<String>) {
        self.backend.clear_calls();
        let value = self.run(fut);
        (value, self.backend.calls())
    }
}
