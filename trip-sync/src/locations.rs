use rand::seq::SliceRandom;
use serde_json::{Value, json};
use supaclient::{Backend, Filter, RowQuery};

use crate::images::{remove_image, upload_image};
use crate::models::{CardLocation, Location, LocationDraft, LocationUpdate, from_row, from_rows};
use crate::mutation::run_optimistic;
use crate::{SyncError, TripSync, keys};

fn require_title(title: &str) -> Result<String, SyncError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(SyncError::Validation("title is required".into()));
    }
    Ok(title.to_string())
}

fn decode_location(value: Value) -> Result<Location, SyncError> {
    Ok(serde_json::from_value(value)?)
}

impl<B: Backend + 'static> TripSync<B> {
    /// One location with its tag names and whether the signed-in user favourited it.
    pub async fn location(&self, id: &str) -> Result<Location, SyncError> {
        let sync = self.clone();
        let id = id.to_string();
        self.cache
            .fetch(keys::location(&id), self.config.location_stale(), || async move {
                sync.load_location(&id).await
            })
            .await
    }

    async fn load_location(&self, id: &str) -> Result<Location, SyncError> {
        let rows = self
            .backend
            .select(RowQuery::from("locations").filter(Filter::eq("id", id)))
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Err(SyncError::NotFound(format!("location {id}")));
        };
        let mut location: Location = from_row(row)?;
        self.attach_tags(std::slice::from_mut(&mut location)).await?;

        if let Some(user) = self.session.current_user() {
            let favourites = self
                .backend
                .select(
                    RowQuery::from("favourites")
                        .columns("location_id")
                        .filter(Filter::eq("user_id", user.id))
                        .filter(Filter::eq("location_id", id)),
                )
                .await?;
            location.is_favourite = Some(!favourites.is_empty());
        }
        Ok(location)
    }

    /// How many locations a destination has.
    pub async fn location_count(&self, direction_id: &str) -> Result<usize, SyncError> {
        let backend = self.backend.clone();
        let query = RowQuery::from("locations")
            .columns("id")
            .filter(Filter::eq("direction_id", direction_id));
        self.cache
            .fetch(
                keys::location_count(direction_id),
                self.config.location_count_stale(),
                || async move { Ok(backend.select(query).await?.len()) },
            )
            .await
    }

    /// A few random locations of a destination for its card, drawn from the first
    /// `card_pool_size` the backend returns.
    pub async fn locations_for_card(&self, direction_id: &str) -> Result<Vec<CardLocation>, SyncError> {
        let backend = self.backend.clone();
        let sample_size = self.config.card_sample_size;
        let direction = direction_id.to_string();
        let query = RowQuery::from("locations")
            .columns("id,title,image_url")
            .filter(Filter::eq("direction_id", direction_id))
            .limit(self.config.card_pool_size);
        self.cache
            .fetch(
                keys::locations_for_card(direction_id),
                self.config.card_sample_stale(),
                || async move {
                    let mut rows = backend.select(query).await?;
                    rows.shuffle(&mut rand::rng());
                    rows.truncate(sample_size);
                    for row in &mut rows {
                        row.insert("direction_id".into(), Value::String(direction.clone()));
                    }
                    from_rows(rows)
                },
            )
            .await
    }

    /// Creates a location with its tags in the given or the active destination.
    ///
    /// An image is uploaded first; if the backend then rejects the location, the image is
    /// removed again.
    pub async fn add_location(&self, draft: LocationDraft) -> Result<Location, SyncError> {
        let result = self.add_location_inner(draft).await;
        self.report(result, "Location added", "Could not add location")
    }

    async fn add_location_inner(&self, draft: LocationDraft) -> Result<Location, SyncError> {
        let user = self.require_user()?;
        let title = require_title(&draft.title)?;
        let direction_id = draft
            .direction_id
            .clone()
            .or_else(|| self.store.active_direction_id())
            .ok_or(SyncError::MissingScope)?;

        let image_url = match &draft.image {
            Some(image) => Some(upload_image(self.backend.as_ref(), &user.id, image).await?),
            None => None,
        };

        run_optimistic(
            || image_url.clone(),
            |image_url| {
                let params = json!({
                    "p_user_id": user.id,
                    "p_direction_id": direction_id,
                    "p_title": title,
                    "p_description": draft.description,
                    "p_address": draft.address,
                    "p_cost": draft.cost,
                    "p_source_url": draft.source_url,
                    "p_image_url": image_url,
                    "p_tags": draft.tags.names(),
                });
                async move {
                    decode_location(self.backend.rpc("create_location_with_tags", params).await?)
                }
            },
            |orphan| async move {
                if let Some(orphan) = orphan {
                    remove_image(self.backend.as_ref(), &orphan).await;
                }
            },
            |_| {
                self.cache.invalidate(&keys::locations_root());
                self.cache.invalidate(&keys::tags());
                self.cache.invalidate(&keys::location_count(&direction_id));
                self.cache.invalidate(&keys::locations_for_card(&direction_id));
            },
        )
        .await
    }

    /// Updates a location and replaces its tags. A replacement image is uploaded before the
    /// update and the old one removed after it.
    pub async fn update_location(
        &self,
        id: &str,
        update: LocationUpdate,
    ) -> Result<Location, SyncError> {
        let result = self.update_location_inner(id, update).await;
        self.report(result, "Location updated", "Could not update location")
    }

    async fn update_location_inner(
        &self,
        id: &str,
        update: LocationUpdate,
    ) -> Result<Location, SyncError> {
        let user = self.require_user()?;
        let title = require_title(&update.title)?;

        let new_image = match &update.image {
            Some(image) => Some(upload_image(self.backend.as_ref(), &user.id, image).await?),
            None => None,
        };
        let image_url = new_image.clone().or_else(|| update.old_image_url.clone());

        let updated = run_optimistic(
            || new_image.clone(),
            |_| {
                let params = json!({
                    "p_user_id": user.id,
                    "p_loc_id": id,
                    "p_title": title,
                    "p_description": update.description,
                    "p_address": update.address,
                    "p_cost": update.cost,
                    "p_source_url": update.source_url,
                    "p_image_url": image_url,
                    "p_tags": update.tags.names(),
                });
                async move {
                    decode_location(self.backend.rpc("update_location_with_tags", params).await?)
                }
            },
            |orphan| async move {
                if let Some(orphan) = orphan {
                    remove_image(self.backend.as_ref(), &orphan).await;
                }
            },
            |_| {
                self.cache.invalidate(&keys::location(id));
                self.cache.invalidate(&keys::locations_root());
                self.cache.invalidate(&keys::tags());
            },
        )
        .await?;

        if let (Some(new_image), Some(old_image)) = (&new_image, &update.old_image_url) {
            if new_image != old_image {
                remove_image(self.backend.as_ref(), old_image).await;
            }
        }
        Ok(updated)
    }

    /// Deletes a location with its tag links, then cleans up its favourites and image. Cleanup
    /// failures are logged only.
    pub async fn delete_location(&self, id: &str, image_url: Option<&str>) -> Result<(), SyncError> {
        let result = self.delete_location_inner(id, image_url).await;
        self.report(result, "Location deleted", "Could not delete location")
    }

    async fn delete_location_inner(&self, id: &str, image_url: Option<&str>) -> Result<(), SyncError> {
        let user = self.require_user()?;
        let deleted = self
            .backend
            .rpc(
                "delete_location",
                json!({ "p_user_id": user.id, "p_location_id": id }),
            )
            .await?;

        if let Err(e) = self
            .backend
            .delete("favourites", vec![Filter::eq("location_id", id)])
            .await
        {
            log::warn!("Failed to delete favourites of location {id}: {e}");
        }
        if let Some(image_url) = image_url {
            remove_image(self.backend.as_ref(), image_url).await;
        }

        self.store.clear_favourite(id);
        self.cache.invalidate(&keys::locations_root());
        self.cache.invalidate(&keys::favourites_root());
        self.cache.remove(&keys::location(id));
        if let Some(direction_id) = deleted.get("direction_id").and_then(Value::as_str) {
            self.cache.invalidate(&keys::location_count(direction_id));
            self.cache.invalidate(&keys::locations_for_card(direction_id));
        }
        Ok(())
    }
}
