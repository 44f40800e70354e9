//! The filtered, cursor-paginated location feed and its realtime reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use chokepoint::{InfiniteData, Page, PageLoader, QueryKey};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::FutureExt;
use serde_json::Value;
use supaclient::{
    Backend, ChangeEvent, ChangeHandler, ChangeKind, Filter, Row, RowQuery, Subscription,
};

use crate::models::{Location, from_rows};
use crate::{SyncError, TripSync, keys};

#[derive(Clone, Debug, PartialEq)]
pub struct LocationPage {
    pub items: Vec<Location>,
    /// `created_at` of the last item, present only when the page was full.
    pub next_cursor: Option<DateTime<Utc>>,
}

impl Page for LocationPage {
    type Cursor = DateTime<Utc>;

    fn next_cursor(&self) -> Option<DateTime<Utc>> {
        self.next_cursor
    }
}

pub type LocationFeed = InfiniteData<LocationPage>;

/// Which locations a feed shows. Each distinct filter is its own feed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LocationFilter {
    pub direction_id: Option<String>,
    pub search: String,
    /// Tag names; a location matches if it has any of them.
    pub tags: Vec<String>,
}

impl LocationFilter {
    pub fn key(&self) -> QueryKey {
        keys::locations(self.direction_id.as_deref(), &self.search, &self.tags)
    }
}

fn cursor_value(cursor: DateTime<Utc>) -> String {
    cursor.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn str_field<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

/// `location` with the columns of `row` written over it. Tags are not a column and survive.
fn merge_row(location: &Location, row: &Row) -> Option<Location> {
    let Ok(Value::Object(mut merged)) = serde_json::to_value(location) else {
        return None;
    };
    for (column, cell) in row {
        if column != "tags" {
            merged.insert(column.clone(), cell.clone());
        }
    }
    match serde_json::from_value(Value::Object(merged)) {
        Ok(location) => Some(location),
        Err(e) => {
            log::warn!("Ignoring update for location {}: {e}", location.id);
            None
        }
    }
}

fn contains(feed: &LocationFeed, id: &str) -> bool {
    feed.pages
        .iter()
        .any(|page| page.items.iter().any(|item| item.id == id))
}

fn patch_feed(feed: &LocationFeed, id: &str, row: &Row) -> Option<LocationFeed> {
    if !contains(feed, id) {
        return None;
    }
    let mut patched = feed.clone();
    for item in patched.pages.iter_mut().flat_map(|page| page.items.iter_mut()) {
        if item.id == id {
            *item = merge_row(item, row)?;
        }
    }
    Some(patched)
}

fn remove_from_feed(feed: &LocationFeed, id: &str) -> Option<LocationFeed> {
    if !contains(feed, id) {
        return None;
    }
    let mut trimmed = feed.clone();
    for page in &mut trimmed.pages {
        page.items.retain(|item| item.id != id);
    }
    Some(trimmed)
}

impl<B: Backend + 'static> TripSync<B> {
    /// The feed filter the UI state currently selects.
    pub fn current_filter(&self) -> LocationFilter {
        let state = self.store.snapshot();
        LocationFilter {
            direction_id: state.active_direction_id,
            search: state.search_query,
            tags: state.selected_tags,
        }
    }

    /// Loads one page: up to `page_size` locations matching `filter`, strictly older than
    /// `cursor`, newest first.
    pub async fn fetch_location_page(
        &self,
        filter: &LocationFilter,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<LocationPage, SyncError> {
        let page_size = self.config.page_size;
        let mut query = RowQuery::from("locations")
            .order_by("created_at", false)
            .limit(page_size);
        if let Some(direction_id) = &filter.direction_id {
            query = query.filter(Filter::eq("direction_id", direction_id.as_str()));
        }
        if !filter.search.is_empty() {
            query = query.filter(Filter::contains("title", &filter.search));
        }
        if let Some(cursor) = cursor {
            query = query.filter(Filter::lt("created_at", cursor_value(cursor)));
        }
        if !filter.tags.is_empty() {
            let ids = self.locations_tagged_with_any(&filter.tags).await?;
            if ids.is_empty() {
                log::debug!("No location carries any of {:?}", filter.tags);
                return Ok(LocationPage {
                    items: Vec::new(),
                    next_cursor: None,
                });
            }
            query = query.filter(Filter::one_of("id", ids));
        }

        let mut items: Vec<Location> = from_rows(self.backend.select(query).await?)?;
        self.attach_tags(&mut items).await?;
        let next_cursor = if items.len() == page_size {
            items.last().map(|item| item.created_at)
        } else {
            None
        };
        Ok(LocationPage { items, next_cursor })
    }

    /// Ids of locations linked to at least one of the named tags.
    async fn locations_tagged_with_any(&self, names: &[String]) -> Result<Vec<Value>, SyncError> {
        let tags = self
            .backend
            .select(
                RowQuery::from("tags")
                    .columns("id")
                    .filter(Filter::one_of("name", names.iter().map(String::as_str))),
            )
            .await?;
        let tag_ids: Vec<Value> = tags.into_iter().filter_map(|mut tag| tag.remove("id")).collect();
        if tag_ids.is_empty() {
            return Ok(Vec::new());
        }

        let links = self
            .backend
            .select(
                RowQuery::from("locations_tags")
                    .columns("location_id")
                    .filter(Filter::one_of("tag_id", tag_ids)),
            )
            .await?;
        let ids: BTreeSet<String> = links
            .iter()
            .filter_map(|link| str_field(link, "location_id"))
            .map(str::to_string)
            .collect();
        Ok(ids.into_iter().map(Value::String).collect())
    }

    /// Fills in the tag names of `items` from the link table.
    pub(crate) async fn attach_tags(&self, items: &mut [Location]) -> Result<(), SyncError> {
        if items.is_empty() {
            return Ok(());
        }
        let links = self
            .backend
            .select(
                RowQuery::from("locations_tags")
                    .columns("location_id,tag_id")
                    .filter(Filter::one_of("location_id", items.iter().map(|item| item.id.as_str()))),
            )
            .await?;
        if links.is_empty() {
            return Ok(());
        }

        let tag_ids: BTreeSet<&str> = links
            .iter()
            .filter_map(|link| str_field(link, "tag_id"))
            .collect();
        let tags = self
            .backend
            .select(RowQuery::from("tags").filter(Filter::one_of("id", tag_ids)))
            .await?;
        let names: BTreeMap<&str, &str> = tags
            .iter()
            .filter_map(|tag| Some((str_field(tag, "id")?, str_field(tag, "name")?)))
            .collect();

        for item in items.iter_mut() {
            item.tags = links
                .iter()
                .filter(|link| str_field(link, "location_id") == Some(item.id.as_str()))
                .filter_map(|link| names.get(str_field(link, "tag_id")?))
                .map(|name| name.to_string())
                .collect();
        }
        Ok(())
    }

    fn page_loader(&self, filter: LocationFilter) -> PageLoader<LocationPage, SyncError> {
        let sync = self.clone();
        Rc::new(move |cursor: Option<DateTime<Utc>>| {
            let sync = sync.clone();
            let filter = filter.clone();
            async move { sync.fetch_location_page(&filter, cursor).await }.boxed_local()
        })
    }

    /// The feed for the current filter. A new filter starts a new feed from its first page.
    pub async fn locations(&self) -> Result<LocationFeed, SyncError> {
        self.locations_for(self.current_filter()).await
    }

    pub async fn locations_for(&self, filter: LocationFilter) -> Result<LocationFeed, SyncError> {
        let loader = self.page_loader(filter.clone());
        self.cache
            .fetch_infinite(filter.key(), self.config.locations_stale(), loader)
            .await
    }

    /// Appends the next page to the feed for the current filter.
    pub async fn fetch_next_locations(&self) -> Result<LocationFeed, SyncError> {
        self.fetch_next_locations_for(self.current_filter()).await
    }

    pub async fn fetch_next_locations_for(
        &self,
        filter: LocationFilter,
    ) -> Result<LocationFeed, SyncError> {
        let loader = self.page_loader(filter.clone());
        self.cache
            .fetch_next_page(filter.key(), self.config.locations_stale(), loader)
            .await
    }

    /// Subscribes cached feeds to every change of the `locations` table. The feeds stay live
    /// until the returned subscription is dropped.
    ///
    /// A channel that cannot be opened is logged and `None` is returned. Feeds then only change
    /// through this client's own writes.
    pub fn watch_locations(&self) -> Option<Subscription> {
        let sync = self.clone();
        let handler: ChangeHandler = Rc::new(move |event: &ChangeEvent| {
            sync.apply_location_change(event);
        });
        match self.backend.subscribe("locations", handler) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                log::warn!("Live location updates are off: {e}");
                None
            }
        }
    }

    /// Reconciles cached locations with one change from the realtime feed.
    ///
    /// Inserts invalidate every feed, since where a new row belongs depends on each filter.
    /// Updates are merged into every cached copy of the row, and deletes remove it, both in
    /// place and without fetching.
    pub fn apply_location_change(&self, event: &ChangeEvent) {
        let Some(id) = event.record_id().map(str::to_string) else {
            log::warn!("Ignoring {:?} event without an id", event.kind);
            return;
        };
        let direction_id = event
            .new
            .as_ref()
            .or(event.old.as_ref())
            .and_then(|row| str_field(row, "direction_id"))
            .map(str::to_string);

        match event.kind {
            ChangeKind::Insert => {
                log::debug!("Location {id} inserted, invalidating feeds");
                self.cache.invalidate(&keys::locations_root());
            }
            ChangeKind::Update => {
                let Some(row) = &event.new else {
                    return;
                };
                let patched = self
                    .cache
                    .set_data_matching::<LocationFeed>(&keys::locations_root(), |feed| {
                        patch_feed(feed, &id, row)
                    });
                self.cache
                    .set_data::<Location>(keys::location(&id), |current| {
                        current.and_then(|location| merge_row(&location, row))
                    });
                log::debug!("Location {id} updated in {patched} feeds");
            }
            ChangeKind::Delete => {
                let trimmed = self
                    .cache
                    .set_data_matching::<LocationFeed>(&keys::locations_root(), |feed| {
                        remove_from_feed(feed, &id)
                    });
                self.cache.remove(&keys::location(&id));
                log::debug!("Location {id} deleted from {trimmed} feeds");
            }
        }

        if event.kind != ChangeKind::Update {
            if let Some(direction_id) = direction_id {
                self.cache.invalidate(&keys::location_count(&direction_id));
                self.cache.invalidate(&keys::locations_for_card(&direction_id));
            }
        }
    }

    /// Every loaded item of `feed` with its effective favourite status, limited to favourites
    /// when the UI asks for that.
    pub fn visible_locations(&self, feed: &LocationFeed) -> Vec<Location> {
        let only_favourites = self.store.show_only_favourites();
        feed.pages
            .iter()
            .flat_map(|page| page.items.iter())
            .filter_map(|item| {
                let favourite = self.store.effective_favourite(item);
                if only_favourites && !favourite {
                    return None;
                }
                let mut item = item.clone();
                item.is_favourite = Some(favourite);
                Some(item)
            })
            .collect()
    }
}
