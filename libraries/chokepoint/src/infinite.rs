//! Paginated ("infinite") entries: a growing list of pages, each remembered together with the
//! cursor it was fetched with, so a refetch can walk the same pages again.

use std::fmt::Debug;
use std::rc::Rc;

use chrono::TimeDelta;
use futures::future::LocalBoxFuture;

use crate::{QueryCache, QueryKey, TypeMismatch, downcast};

pub trait Page: Clone + 'static {
    type Cursor: Clone + Debug + PartialEq + 'static;

    /// Cursor for the page after this one, or `None` if this is the last page.
    fn next_cursor(&self) -> Option<Self::Cursor>;
}

pub type PageLoader<P, E> =
    Rc<dyn Fn(Option<<P as Page>::Cursor>) -> LocalBoxFuture<'static, Result<P, E>>>;

#[derive(Clone, Debug, PartialEq)]
pub struct InfiniteData<P: Page> {
    pub pages: Vec<P>,
    pub page_params: Vec<Option<P::Cursor>>,
}

impl<P: Page> InfiniteData<P> {
    pub fn first(page: P) -> Self {
        Self {
            pages: vec![page],
            page_params: vec![None],
        }
    }

    pub fn next_cursor(&self) -> Option<P::Cursor> {
        self.pages.last().and_then(Page::next_cursor)
    }

    pub fn has_next_page(&self) -> bool {
        self.next_cursor().is_some()
    }

    pub fn push(&mut self, cursor: Option<P::Cursor>, page: P) {
        self.page_params.push(cursor);
        self.pages.push(page);
    }
}

async fn walk_pages<P: Page, E>(
    loader: PageLoader<P, E>,
    page_count: usize,
) -> Result<InfiniteData<P>, E> {
    let mut data = InfiniteData::first(loader(None).await?);
    while data.pages.len() < page_count {
        let Some(cursor) = data.next_cursor() else {
            break;
        };
        let page = loader(Some(cursor.clone())).await?;
        data.push(Some(cursor), page);
    }
    Ok(data)
}

impl<E> QueryCache<E>
where
    E: Clone + From<TypeMismatch> + 'static,
{
    /// Like [`QueryCache::fetch`] for paginated data. A missing entry loads the first page; a
    /// refetch loads as many pages as were cached before, starting over from the first.
    pub async fn fetch_infinite<P: Page>(
        &self,
        key: QueryKey,
        stale_time: TimeDelta,
        loader: PageLoader<P, E>,
    ) -> Result<InfiniteData<P>, E> {
        let cache = self.clone();
        let walk_key = key.clone();
        self.fetch(key, stale_time, move || async move {
            let page_count = cache
                .get_data::<InfiniteData<P>>(&walk_key)
                .map_or(1, |data| data.pages.len().max(1));
            walk_pages(loader, page_count).await
        })
        .await
    }

    /// Loads the page after the last cached one and appends it. An invalidated entry is
    /// reloaded first, so the page follows current data.
    ///
    /// The page is appended to the data current when it arrives, so in-place patches made while
    /// it was loading are kept. If the entry was replaced in the meantime and no longer ends at
    /// the cursor that was used, the page is dropped.
    pub async fn fetch_next_page<P: Page>(
        &self,
        key: QueryKey,
        stale_time: TimeDelta,
        loader: PageLoader<P, E>,
    ) -> Result<InfiniteData<P>, E> {
        if let Some(pending) = self.pending(&key) {
            pending.await?;
        }
        if self.is_invalidated(&key) {
            log::debug!("`{key}` is invalidated, reloading it before the next page");
            self.fetch_infinite(key.clone(), stale_time, loader.clone())
                .await?;
        }
        let Some(current) = self.get_data::<InfiniteData<P>>(&key) else {
            return self.fetch_infinite(key, stale_time, loader).await;
        };
        let Some(cursor) = current.next_cursor() else {
            return Ok(current);
        };

        let cache = self.clone();
        let append_key = key.clone();
        let in_flight = self.start_fetch(key.clone(), async move {
            let page = loader(Some(cursor.clone())).await?;
            let mut data = cache
                .get_data::<InfiniteData<P>>(&append_key)
                .unwrap_or(current);
            if data.next_cursor().as_ref() == Some(&cursor) {
                data.push(Some(cursor), page);
            } else {
                log::debug!("Dropping page for `{append_key}`, the entry moved on");
            }
            Ok(data)
        });
        in_flight.await.and_then(|data| downcast(&key, &data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, TestError};
    use futures::FutureExt;
    use std::cell::{Cell, RefCell};

    #[derive(Clone, Debug, PartialEq)]
    struct NumberPage {
        items: Vec<u32>,
        next: Option<u32>,
    }

    impl Page for NumberPage {
        type Cursor = u32;

        fn next_cursor(&self) -> Option<u32> {
            self.next
        }
    }

    /// Serves descending numbers from `top`, three per page, strictly below the cursor.
    fn countdown(top: Rc<Cell<u32>>, calls: Rc<Cell<usize>>) -> PageLoader<NumberPage, TestError> {
        Rc::new(move |cursor: Option<u32>| {
            calls.set(calls.get() + 1);
            let start = cursor.unwrap_or(top.get() + 1);
            let items: Vec<u32> = (1..start).rev().take(3).collect();
            let next = (items.len() == 3).then(|| items[2]);
            async move { Ok::<_, TestError>(NumberPage { items, next }) }.boxed_local()
        })
    }

    fn key() -> QueryKey {
        QueryKey::new("numbers")
    }

    #[test]
    fn test_pages_are_strictly_older_than_cursor() {
        let mut h = Harness::new();
        let top = Rc::new(Cell::new(7));
        let loader = countdown(top, Rc::new(Cell::new(0)));

        let first = h
            .pool
            .run_until(h.cache.fetch_infinite(key(), TimeDelta::seconds(60), loader.clone()))
            .unwrap();
        assert_eq!(first.pages[0].items, vec![7, 6, 5]);

        let second = h
            .pool
            .run_until(h.cache.fetch_next_page(key(), TimeDelta::seconds(60), loader.clone()))
            .unwrap();
        assert_eq!(second.pages[1].items, vec![4, 3, 2]);
        assert_eq!(second.page_params, vec![None, Some(5)]);

        let third = h
            .pool
            .run_until(h.cache.fetch_next_page(key(), TimeDelta::seconds(60), loader.clone()))
            .unwrap();
        assert_eq!(third.pages[2].items, vec![1]);
        assert!(!third.has_next_page());

        let unchanged = h
            .pool
            .run_until(h.cache.fetch_next_page(key(), TimeDelta::seconds(60), loader))
            .unwrap();
        assert_eq!(unchanged.pages.len(), 3);
    }

    #[test]
    fn test_refetch_rewalks_loaded_pages() {
        let mut h = Harness::new();
        let top = Rc::new(Cell::new(9));
        let calls = Rc::new(Cell::new(0));
        let loader = countdown(top.clone(), calls.clone());

        h.pool
            .run_until(h.cache.fetch_infinite(key(), TimeDelta::seconds(60), loader.clone()))
            .unwrap();
        h.pool
            .run_until(h.cache.fetch_next_page(key(), TimeDelta::seconds(60), loader.clone()))
            .unwrap();
        assert_eq!(calls.get(), 2);

        top.set(10);
        h.cache.invalidate(&key());
        let refetched = h
            .pool
            .run_until(h.cache.fetch_infinite(key(), TimeDelta::seconds(60), loader))
            .unwrap();

        assert_eq!(calls.get(), 4);
        assert_eq!(refetched.pages.len(), 2);
        assert_eq!(refetched.pages[0].items, vec![10, 9, 8]);
        assert_eq!(refetched.pages[1].items, vec![7, 6, 5]);
    }

    #[test]
    fn test_next_page_of_invalidated_entry_reloads_first() {
        let mut h = Harness::new();
        let top = Rc::new(Cell::new(9));
        let calls = Rc::new(Cell::new(0));
        let loader = countdown(top.clone(), calls.clone());
        h.pool
            .run_until(h.cache.fetch_infinite(key(), TimeDelta::seconds(60), loader.clone()))
            .unwrap();

        top.set(10);
        h.cache.invalidate(&key());
        let data = h
            .pool
            .run_until(h.cache.fetch_next_page(key(), TimeDelta::seconds(60), loader))
            .unwrap();

        assert_eq!(calls.get(), 3);
        assert_eq!(data.pages[0].items, vec![10, 9, 8]);
        assert_eq!(data.pages[1].items, vec![7, 6, 5]);
        assert!(!h.cache.is_invalidated(&key()));
    }

    #[test]
    fn test_next_page_keeps_patches_made_while_loading() {
        let mut h = Harness::new();
        let top = Rc::new(Cell::new(6));
        let loader = countdown(top, Rc::new(Cell::new(0)));
        h.pool
            .run_until(h.cache.fetch_infinite(key(), TimeDelta::seconds(60), loader.clone()))
            .unwrap();

        let (tx, rx) = futures::channel::oneshot::channel::<()>();
        let gate = Rc::new(RefCell::new(Some(rx)));
        let gated: PageLoader<NumberPage, TestError> = Rc::new(move |cursor: Option<u32>| {
            let inner = loader(cursor);
            let gate = gate.borrow_mut().take();
            async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                inner.await
            }
            .boxed_local()
        });

        let cache = h.cache.clone();
        let result = Rc::new(RefCell::new(None));
        let out = result.clone();
        futures::task::LocalSpawnExt::spawn_local(&h.pool.spawner(), async move {
            let data = cache
                .fetch_next_page(key(), TimeDelta::seconds(60), gated)
                .await;
            *out.borrow_mut() = Some(data);
        })
        .unwrap();
        h.pool.run_until_stalled();

        h.cache
            .set_data_matching::<InfiniteData<NumberPage>>(&key(), |data| {
                let mut data = data.clone();
                data.pages[0].items.retain(|n| *n != 5);
                Some(data)
            });
        tx.send(()).unwrap();
        h.pool.run_until_stalled();

        let data = h.cache.get_data::<InfiniteData<NumberPage>>(&key()).unwrap();
        assert_eq!(data.pages[0].items, vec![6, 4]);
        assert_eq!(data.pages[1].items, vec![3, 2, 1]);
        assert!(result.borrow().is_some());
    }
}
