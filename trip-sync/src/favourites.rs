use supaclient::{Backend, Filter, Row, RowQuery};

use crate::models::{Favourite, from_rows};
use crate::mutation::run_optimistic;
use crate::{SyncError, TripSync, keys};

impl<B: Backend + 'static> TripSync<B> {
    /// The favourites stored for `user_id`.
    pub async fn favourites(&self, user_id: &str) -> Result<Vec<Favourite>, SyncError> {
        let backend = self.backend.clone();
        let query = RowQuery::from("favourites")
            .columns("user_id,location_id")
            .filter(Filter::eq("user_id", user_id));
        self.cache
            .fetch(keys::favourites(user_id), self.config.locations_stale(), || async move {
                from_rows(backend.select(query).await?)
            })
            .await
    }

    /// Brings the local favourites map in line with the session: loads the signed-in user's
    /// favourites into it, or empties it and drops cached favourites when nobody is signed in.
    pub async fn sync_favourites(&self) -> Result<(), SyncError> {
        let Some(user) = self.session.current_user() else {
            self.store.hydrate_favourites(None, &[]);
            self.cache.remove(&keys::favourites_root());
            return Ok(());
        };
        let favourites = self.favourites(&user.id).await.inspect_err(|e| {
            log::error!("Could not load favourites of {}: {e}", user.id);
        })?;
        let ids: Vec<String> = favourites.into_iter().map(|f| f.location_id).collect();
        self.store.hydrate_favourites(Some(&user.id), &ids);
        Ok(())
    }

    /// Flips the favourite status of a location for the signed-in user and returns the new
    /// status.
    ///
    /// Without a user nothing is sent: the login prompt is raised and
    /// [`SyncError::AuthRequired`] returned. Otherwise the local flag flips at once and is
    /// flipped back if the backend refuses.
    pub async fn toggle_favourite(&self, location_id: &str) -> Result<bool, SyncError> {
        let result = self.toggle_favourite_inner(location_id).await;
        self.report(result, "Favourites updated", "Could not update favourites")
    }

    async fn toggle_favourite_inner(&self, location_id: &str) -> Result<bool, SyncError> {
        let Some(user) = self.session.current_user() else {
            self.store.set_login_prompt(true);
            return Err(SyncError::AuthRequired);
        };
        self.cache.cancel(&keys::favourites(&user.id));

        run_optimistic(
            || self.store.toggle_favourite(location_id),
            |now_favourite| {
                let now_favourite = *now_favourite;
                let user_id = user.id.clone();
                async move {
                    if now_favourite {
                        let mut row = Row::new();
                        row.insert("user_id".into(), user_id.into());
                        row.insert("location_id".into(), location_id.into());
                        self.backend.insert("favourites", vec![row]).await?;
                    } else {
                        self.backend
                            .delete(
                                "favourites",
                                vec![
                                    Filter::eq("user_id", user_id),
                                    Filter::eq("location_id", location_id),
                                ],
                            )
                            .await?;
                    }
                    Ok(now_favourite)
                }
            },
            |_| async move {
                self.store.toggle_favourite(location_id);
            },
            |_| {
                self.cache.invalidate(&keys::favourites(&user.id));
                self.cache.invalidate(&keys::location(location_id));
                self.cache.invalidate(&keys::locations_root());
            },
        )
        .await
    }
}
