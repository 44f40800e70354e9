use supaclient::{Backend, Filter, Row, RowQuery};

use crate::models::{Tag, from_row, from_rows};
use crate::{SyncError, TripSync, keys};

impl<B: Backend + 'static> TripSync<B> {
    /// The tag dictionary, sorted by name.
    pub async fn tags(&self) -> Result<Vec<Tag>, SyncError> {
        let backend = self.backend.clone();
        self.cache
            .fetch(keys::tags(), self.config.tags_stale(), || async move {
                from_rows(backend.select(RowQuery::from("tags").order_by("name", true)).await?)
            })
            .await
    }

    /// Warms the tag dictionary so tag pickers open without waiting.
    pub async fn prefetch_tags(&self) {
        if let Err(e) = self.tags().await {
            log::warn!("Prefetching tags failed: {e}");
        }
    }

    /// Returns the tag named `name`, creating it if needed. An existing tag whose name differs
    /// only in case is reused, and losing a creation race to another user counts as success.
    pub async fn create_tag(&self, name: &str) -> Result<Tag, SyncError> {
        self.require_user()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::Validation("tag name is required".into()));
        }

        let existing = self.tags().await?;
        if let Some(tag) = existing
            .into_iter()
            .find(|tag| tag.name.to_lowercase() == name.to_lowercase())
        {
            return Ok(tag);
        }

        let mut row = Row::new();
        row.insert("name".into(), name.into());
        let created = match self.backend.insert("tags", vec![row]).await {
            Ok(rows) => rows.into_iter().next(),
            Err(e) if e.is_unique_violation() => {
                log::debug!("Tag {name} was created concurrently");
                self.backend
                    .select(RowQuery::from("tags").filter(Filter::eq("name", name)))
                    .await?
                    .into_iter()
                    .next()
            }
            Err(e) => return Err(e.into()),
        };
        self.cache.invalidate(&keys::tags());
        match created {
            Some(row) => from_row(row),
            None => Err(SyncError::NotFound(format!("tag {name}"))),
        }
    }
}
