//! A single-threaded query cache with shared in-flight fetches and stale-while-revalidate.
//! No `RefCell` borrow is held across an `.await` or while user callbacks run.

mod infinite;
mod key;

pub use infinite::{InfiniteData, Page, PageLoader};
pub use key::QueryKey;

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::{FutureExt, LocalBoxFuture, Shared};
use slotmap::{SlotMap, new_key_type};

/// Runs background revalidation.
pub type Spawner = Rc<dyn Fn(LocalBoxFuture<'static, ()>)>;

pub type Clock = Rc<dyn Fn() -> DateTime<Utc>>;

new_key_type! {
    pub struct ListenerKey;
}

/// A cached value was read back as a different type than it was stored with.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("cached value for `{key}` is not a {expected}")]
pub struct TypeMismatch {
    pub key: QueryKey,
    pub expected: &'static str,
}

type Erased = Rc<dyn Any>;
type InFlight<E> = Shared<LocalBoxFuture<'static, Result<Erased, E>>>;
type Listener = Rc<dyn Fn(&QueryKey)>;

struct Entry<E> {
    data: Option<Erased>,
    updated_at: Option<DateTime<Utc>>,
    invalidated: bool,
    in_flight: Option<(u64, InFlight<E>)>,
}

impl<E> Entry<E> {
    fn empty() -> Self {
        Self {
            data: None,
            updated_at: None,
            invalidated: false,
            in_flight: None,
        }
    }
}

struct Inner<E> {
    entries: HashMap<QueryKey, Entry<E>>,
    listeners: SlotMap<ListenerKey, (QueryKey, Listener)>,
    next_fetch_id: u64,
}

impl<E> Inner<E> {
    fn listeners_for(&self, key: &QueryKey) -> Vec<Listener> {
        self.listeners
            .values()
            .filter(|(prefix, _)| key.starts_with(prefix))
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    fn matching_keys(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        self.entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }
}

enum Lookup<E> {
    Fresh(Erased),
    Stale { data: Erased, refetching: bool },
    Pending(InFlight<E>),
    Miss,
}

pub struct QueryCache<E> {
    inner: Rc<RefCell<Inner<E>>>,
    spawner: Spawner,
    clock: Clock,
}

impl<E> Clone for QueryCache<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            spawner: self.spawner.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<E> QueryCache<E>
where
    E: Clone + From<TypeMismatch> + 'static,
{
    pub fn new(spawner: Spawner) -> Self {
        Self::with_clock(spawner, Rc::new(Utc::now))
    }

    pub fn with_clock(spawner: Spawner, clock: Clock) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                entries: HashMap::new(),
                listeners: SlotMap::with_key(),
                next_fetch_id: 0,
            })),
            spawner,
            clock,
        }
    }

    /// Returns the value for `key`. Stale data is returned as-is while one background refetch
    /// runs; missing or invalidated data is loaded, sharing any load already running.
    pub async fn fetch<T, F, Fut>(
        &self,
        key: QueryKey,
        stale_time: TimeDelta,
        loader: F,
    ) -> Result<T, E>
    where
        T: Clone + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + 'static,
    {
        let now = (self.clock)();
        match self.lookup(&key, stale_time, now) {
            Lookup::Fresh(data) => downcast(&key, &data),
            Lookup::Stale { data, refetching } => {
                if !refetching {
                    log::debug!("Serving stale `{key}` while revalidating");
                    let revalidation = self.start_fetch(key.clone(), loader());
                    (self.spawner)(revalidation.map(|_| ()).boxed_local());
                }
                downcast(&key, &data)
            }
            Lookup::Pending(in_flight) => {
                log::debug!("Joining in-flight fetch for `{key}`");
                in_flight.await.and_then(|data| downcast(&key, &data))
            }
            Lookup::Miss => {
                let in_flight = self.start_fetch(key.clone(), loader());
                in_flight.await.and_then(|data| downcast(&key, &data))
            }
        }
    }

    fn lookup(&self, key: &QueryKey, stale_time: TimeDelta, now: DateTime<Utc>) -> Lookup<E> {
        let inner = self.inner.borrow();
        let Some(entry) = inner.entries.get(key) else {
            return Lookup::Miss;
        };
        let pending = entry.in_flight.as_ref().map(|(_, fut)| fut.clone());

        match &entry.data {
            Some(data) if !entry.invalidated => {
                let fresh = entry
                    .updated_at
                    .is_some_and(|updated_at| now - updated_at < stale_time);
                if fresh {
                    Lookup::Fresh(data.clone())
                } else {
                    Lookup::Stale {
                        data: data.clone(),
                        refetching: pending.is_some(),
                    }
                }
            }
            _ => match pending {
                Some(fut) => Lookup::Pending(fut),
                None => Lookup::Miss,
            },
        }
    }

    fn start_fetch<T, Fut>(&self, key: QueryKey, fut: Fut) -> InFlight<E>
    where
        T: 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
    {
        let weak = Rc::downgrade(&self.inner);
        let clock = self.clock.clone();
        let mut inner = self.inner.borrow_mut();
        inner.next_fetch_id += 1;
        let fetch_id = inner.next_fetch_id;

        let commit_key = key.clone();
        let shared = async move {
            let result = fut.await.map(|value| Rc::new(value) as Erased);
            commit(&weak, &commit_key, fetch_id, &result, clock());
            result
        }
        .boxed_local()
        .shared();

        inner
            .entries
            .entry(key)
            .or_insert_with(Entry::empty)
            .in_flight = Some((fetch_id, shared.clone()));
        shared
    }

    fn pending(&self, key: &QueryKey) -> Option<InFlight<E>> {
        self.inner
            .borrow()
            .entries
            .get(key)
            .and_then(|entry| entry.in_flight.as_ref().map(|(_, fut)| fut.clone()))
    }

    pub fn get_data<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
        let inner = self.inner.borrow();
        let data = inner.entries.get(key)?.data.as_ref()?;
        data.downcast_ref::<T>().cloned()
    }

    /// Replaces the value of `key` with `updater(current)`. Returning `None` leaves the entry
    /// untouched.
    pub fn set_data<T: Clone + 'static>(
        &self,
        key: QueryKey,
        updater: impl FnOnce(Option<T>) -> Option<T>,
    ) {
        let current = self.get_data::<T>(&key);
        let Some(next) = updater(current) else {
            return;
        };
        let now = (self.clock)();
        let listeners = {
            let mut inner = self.inner.borrow_mut();
            let entry = inner.entries.entry(key.clone()).or_insert_with(Entry::empty);
            entry.data = Some(Rc::new(next));
            entry.updated_at = Some(now);
            entry.invalidated = false;
            inner.listeners_for(&key)
        };
        notify(listeners, &key);
    }

    /// Returns how many entries under `prefix` the updater changed.
    pub fn set_data_matching<T: Clone + 'static>(
        &self,
        prefix: &QueryKey,
        mut updater: impl FnMut(&T) -> Option<T>,
    ) -> usize {
        let candidates: Vec<(QueryKey, T)> = {
            let inner = self.inner.borrow();
            inner
                .entries
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .filter_map(|(key, entry)| {
                    let data = entry.data.as_ref()?.downcast_ref::<T>()?;
                    Some((key.clone(), data.clone()))
                })
                .collect()
        };

        let updates: Vec<(QueryKey, T)> = candidates
            .into_iter()
            .filter_map(|(key, data)| updater(&data).map(|next| (key, next)))
            .collect();

        let now = (self.clock)();
        let mut changed = 0;
        for (key, next) in updates {
            let listeners = {
                let mut inner = self.inner.borrow_mut();
                let Some(entry) = inner.entries.get_mut(&key) else {
                    continue;
                };
                entry.data = Some(Rc::new(next));
                entry.updated_at = Some(now);
                inner.listeners_for(&key)
            };
            changed += 1;
            notify(listeners, &key);
        }
        changed
    }

    /// Marks every entry under `prefix` as invalid and abandons their in-flight fetches.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let (keys, listeners) = {
            let mut inner = self.inner.borrow_mut();
            let keys = inner.matching_keys(prefix);
            for key in &keys {
                if let Some(entry) = inner.entries.get_mut(key) {
                    entry.invalidated = true;
                    entry.in_flight = None;
                }
            }
            let listeners: Vec<_> = keys.iter().map(|key| inner.listeners_for(key)).collect();
            (keys, listeners)
        };
        log::debug!("Invalidated {} entries under `{prefix}`", keys.len());
        for (key, listeners) in keys.iter().zip(listeners) {
            notify(listeners, key);
        }
        keys.len()
    }

    /// Drops every entry under `prefix`. Fetches still running for them are not written back.
    pub fn remove(&self, prefix: &QueryKey) -> usize {
        let mut inner = self.inner.borrow_mut();
        let keys = inner.matching_keys(prefix);
        for key in &keys {
            inner.entries.remove(key);
        }
        log::debug!("Removed {} entries under `{prefix}`", keys.len());
        keys.len()
    }

    /// Current waiters still get their result, but it is not stored.
    pub fn cancel(&self, prefix: &QueryKey) -> usize {
        let mut inner = self.inner.borrow_mut();
        let keys = inner.matching_keys(prefix);
        let mut cancelled = 0;
        for key in &keys {
            if let Some(entry) = inner.entries.get_mut(key) {
                if entry.in_flight.take().is_some() {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    pub fn is_fetching(&self, prefix: &QueryKey) -> bool {
        self.inner
            .borrow()
            .entries
            .iter()
            .any(|(key, entry)| key.starts_with(prefix) && entry.in_flight.is_some())
    }

    pub fn is_invalidated(&self, key: &QueryKey) -> bool {
        self.inner
            .borrow()
            .entries
            .get(key)
            .is_some_and(|entry| entry.invalidated)
    }

    pub fn keys(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        let mut keys = self.inner.borrow().matching_keys(prefix);
        keys.sort();
        keys
    }

    /// Calls `listener` after every write or invalidation of a key under `prefix`.
    pub fn subscribe(
        &self,
        prefix: QueryKey,
        listener: impl Fn(&QueryKey) + 'static,
    ) -> ListenerKey {
        let listener: Listener = Rc::new(listener);
        self.inner.borrow_mut().listeners.insert((prefix, listener))
    }

    pub fn unsubscribe(&self, key: ListenerKey) {
        self.inner.borrow_mut().listeners.remove(key);
    }
}

fn downcast<T, E>(key: &QueryKey, data: &Erased) -> Result<T, E>
where
    T: Clone + 'static,
    E: From<TypeMismatch>,
{
    data.downcast_ref::<T>().cloned().ok_or_else(|| {
        log::error!("Type mismatch reading `{key}`");
        TypeMismatch {
            key: key.clone(),
            expected: std::any::type_name::<T>(),
        }
        .into()
    })
}

fn commit<E>(
    weak: &Weak<RefCell<Inner<E>>>,
    key: &QueryKey,
    fetch_id: u64,
    result: &Result<Erased, E>,
    now: DateTime<Utc>,
) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let listeners = {
        let mut inner = inner.borrow_mut();
        let Some(entry) = inner.entries.get_mut(key) else {
            log::debug!("Dropping result for removed `{key}`");
            return;
        };
        if !matches!(entry.in_flight, Some((current, _)) if current == fetch_id) {
            log::debug!("Dropping superseded result for `{key}`");
            return;
        }
        entry.in_flight = None;
        match result {
            Ok(data) => {
                entry.data = Some(data.clone());
                entry.updated_at = Some(now);
                entry.invalidated = false;
            }
            Err(_) => {
                log::warn!("Fetch for `{key}` failed, keeping previous data");
                return;
            }
        }
        inner.listeners_for(key)
    };
    notify(listeners, key);
}

fn notify(listeners: Vec<Listener>, key: &QueryKey) {
    for listener in listeners {
        listener(key);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;
    use std::cell::Cell;

    #[derive(Debug, Clone, PartialEq)]
    pub enum TestError {
        Failed(String),
        Mismatch(TypeMismatch),
    }

    impl From<TypeMismatch> for TestError {
        fn from(err: TypeMismatch) -> Self {
            TestError::Mismatch(err)
        }
    }

    pub struct Harness {
        pub pool: LocalPool,
        pub cache: QueryCache<TestError>,
        pub now: Rc<Cell<DateTime<Utc>>>,
    }

    impl Harness {
        pub fn new() -> Self {
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
            Self { pool, cache, now }
        }

        pub fn advance(&self, by: TimeDelta) {
            self.now.set(self.now.get() + by);
        }
    }
}
