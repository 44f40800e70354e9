use serde_json::json;
use supaclient::{Backend, RowQuery};

use crate::images::{remove_image, upload_image};
use crate::models::{Destination, DestinationUpdate, NewDestination, from_rows};
use crate::mutation::run_optimistic;
use crate::session::AuthStatus;
use crate::{SyncError, TripSync, keys};

fn required(value: &str, field: &str) -> Result<String, SyncError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SyncError::Validation(format!("{field} is required")));
    }
    Ok(value.to_string())
}

fn decode_one(value: serde_json::Value) -> Result<Destination, SyncError> {
    Ok(serde_json::from_value(value)?)
}

impl<B: Backend + 'static> TripSync<B> {
    /// Every destination, newest first. Only available to signed-in users.
    pub async fn directions(&self) -> Result<Vec<Destination>, SyncError> {
        if self.session.status() != AuthStatus::Authenticated {
            return Err(SyncError::NotAuthenticated);
        }
        let backend = self.backend.clone();
        self.cache
            .fetch(keys::directions(), self.config.directions_stale(), || async move {
                let rows = backend
                    .select(RowQuery::from("directions").order_by("created_at", false))
                    .await?;
                from_rows(rows)
            })
            .await
    }

    pub async fn add_destination(&self, draft: NewDestination) -> Result<Destination, SyncError> {
        let result = self.add_destination_inner(draft).await;
        self.report(result, "Destination created", "Could not create destination")
    }

    async fn add_destination_inner(&self, draft: NewDestination) -> Result<Destination, SyncError> {
        let user = self.require_user()?;
        let title = required(&draft.title, "title")?;
        let country = required(&draft.country, "country")?;
        let Some(cover) = &draft.cover else {
            return Err(SyncError::Validation("a cover image is required".into()));
        };

        let cover_url = upload_image(self.backend.as_ref(), &user.id, cover).await?;
        run_optimistic(
            || cover_url.clone(),
            |cover_url| {
                let params = json!({
                    "p_user_id": user.id,
                    "p_title": title,
                    "p_country": country,
                    "p_city": draft.city,
                    "p_cover_url": cover_url,
                });
                async move { decode_one(self.backend.rpc("add_direction", params).await?) }
            },
            |orphan| async move { remove_image(self.backend.as_ref(), &orphan).await },
            |_| {
                self.cache.invalidate(&keys::directions());
            },
        )
        .await
    }

    /// Updates a destination, replacing its cover if `update.cover` is set. The old cover is
    /// removed only after the backend accepted the new one.
    pub async fn update_destination(
        &self,
        id: &str,
        update: DestinationUpdate,
    ) -> Result<Destination, SyncError> {
        let result = self.update_destination_inner(id, update).await;
        self.report(result, "Destination updated", "Could not update destination")
    }

    async fn update_destination_inner(
        &self,
        id: &str,
        update: DestinationUpdate,
    ) -> Result<Destination, SyncError> {
        let user = self.require_user()?;
        let title = required(&update.title, "title")?;
        let country = required(&update.country, "country")?;

        let new_cover = match &update.cover {
            Some(cover) => Some(upload_image(self.backend.as_ref(), &user.id, cover).await?),
            None => None,
        };
        let cover_url = new_cover.clone().or_else(|| update.old_cover_url.clone());

        let updated = run_optimistic(
            || new_cover.clone(),
            |_| {
                let params = json!({
                    "p_user_id": user.id,
                    "p_direction_id": id,
                    "p_title": title,
                    "p_country": country,
                    "p_city": update.city,
                    "p_cover_url": cover_url,
                });
                async move { decode_one(self.backend.rpc("update_direction", params).await?) }
            },
            |orphan| async move {
                if let Some(orphan) = orphan {
                    remove_image(self.backend.as_ref(), &orphan).await;
                }
            },
            |_| {
                self.cache.invalidate(&keys::directions());
            },
        )
        .await?;

        if let (Some(new_cover), Some(old_cover)) = (&new_cover, &update.old_cover_url) {
            if new_cover != old_cover {
                remove_image(self.backend.as_ref(), old_cover).await;
            }
        }
        Ok(updated)
    }

    /// Deletes a destination with all of its locations.
    ///
    /// The destination leaves the cached list before the backend is asked; if the backend
    /// refuses, the list is put back exactly as it was.
    pub async fn delete_destination(
        &self,
        id: &str,
        cover_url: Option<&str>,
    ) -> Result<(), SyncError> {
        let result = self.delete_destination_inner(id, cover_url).await;
        self.report(result, "Destination deleted", "Could not delete destination")
    }

    async fn delete_destination_inner(
        &self,
        id: &str,
        cover_url: Option<&str>,
    ) -> Result<(), SyncError> {
        let user = self.require_user()?;
        self.cache.cancel(&keys::directions());

        run_optimistic(
            || {
                let snapshot = self.cache.get_data::<Vec<Destination>>(&keys::directions());
                self.cache
                    .set_data::<Vec<Destination>>(keys::directions(), |current| {
                        current.map(|list| list.into_iter().filter(|d| d.id != id).collect())
                    });
                snapshot
            },
            |_| {
                let params = json!({ "p_user_id": user.id, "p_direction_id": id });
                async move {
                    self.backend.rpc("delete_direction", params).await?;
                    Ok(())
                }
            },
            |snapshot| async move {
                if let Some(snapshot) = snapshot {
                    self.cache
                        .set_data::<Vec<Destination>>(keys::directions(), |_| Some(snapshot));
                }
            },
            |_| {
                self.cache.invalidate(&keys::directions());
                self.cache.remove(&keys::locations_root());
                self.cache.remove(&keys::location_count(id));
                self.cache.remove(&keys::locations_for_card(id));
                if self.store.active_direction_id().as_deref() == Some(id) {
                    self.store.set_active_direction(None);
                }
            },
        )
        .await?;

        if let Some(cover_url) = cover_url {
            remove_image(self.backend.as_ref(), cover_url).await;
        }
        Ok(())
    }
}
