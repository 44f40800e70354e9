//! Process-wide UI state: the active destination, search text, selected tags and the optimistic
//! favourites map.
//!
//! The state is owned by a [`UiStore`] handle and only changes through its action methods. Only
//! the favourites map is persisted.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::models::Location;
use crate::persistence::StateStorage;

pub const STORAGE_KEY: &str = "trip-ui";
pub const STORAGE_VERSION: u32 = 2;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterState {
    pub active_direction_id: Option<String>,
    pub search_query: String,
    pub selected_tags: Vec<String>,
    pub show_only_favourites: bool,
    /// Location id to favourite flag, as the user last saw it.
    pub favourites: BTreeMap<String, bool>,
    /// The user whose server-side favourites were last loaded into `favourites`.
    pub favourites_hydrated_for: Option<String>,
    pub show_login_prompt: bool,
}

#[derive(Serialize, Deserialize)]
struct Persisted {
    version: u32,
    state: PersistedState,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    favourites: BTreeMap<String, bool>,
}

struct StoreInner {
    state: FilterState,
    storage: Option<Rc<dyn StateStorage>>,
}

#[derive(Clone)]
pub struct UiStore {
    inner: Rc<RefCell<StoreInner>>,
}

impl Default for UiStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UiStore {
    /// A store that keeps nothing across restarts.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(StoreInner {
                state: FilterState::default(),
                storage: None,
            })),
        }
    }

    /// Restores the favourites map from `storage` and writes it back there on every change.
    /// Documents of another version are ignored.
    pub fn load(storage: Rc<dyn StateStorage>) -> Self {
        let mut state = FilterState::default();
        match storage.read(STORAGE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Persisted>(&raw) {
                Ok(persisted) if persisted.version == STORAGE_VERSION => {
                    state.favourites = persisted.state.favourites;
                }
                Ok(persisted) => {
                    log::info!(
                        "Discarding UI state of version {}, expected {STORAGE_VERSION}",
                        persisted.version
                    );
                }
                Err(e) => log::warn!("Could not parse persisted UI state: {e}"),
            },
            Ok(None) => {}
            Err(e) => log::error!("Could not read persisted UI state: {e}"),
        }
        Self {
            inner: Rc::new(RefCell::new(StoreInner {
                state,
                storage: Some(storage),
            })),
        }
    }

    pub fn snapshot(&self) -> FilterState {
        self.inner.borrow().state.clone()
    }

    pub fn active_direction_id(&self) -> Option<String> {
        self.inner.borrow().state.active_direction_id.clone()
    }

    pub fn search_query(&self) -> String {
        self.inner.borrow().state.search_query.clone()
    }

    pub fn selected_tags(&self) -> Vec<String> {
        self.inner.borrow().state.selected_tags.clone()
    }

    pub fn show_only_favourites(&self) -> bool {
        self.inner.borrow().state.show_only_favourites
    }

    pub fn show_login_prompt(&self) -> bool {
        self.inner.borrow().state.show_login_prompt
    }

    pub fn favourites_hydrated_for(&self) -> Option<String> {
        self.inner.borrow().state.favourites_hydrated_for.clone()
    }

    fn update(&self, action: impl FnOnce(&mut FilterState)) {
        action(&mut self.inner.borrow_mut().state);
    }

    /// Like `update`, for actions touching the persisted slice.
    fn update_persisted(&self, action: impl FnOnce(&mut FilterState)) {
        self.update(action);
        self.persist();
    }

    fn persist(&self) {
        let (storage, document) = {
            let inner = self.inner.borrow();
            let Some(storage) = inner.storage.clone() else {
                return;
            };
            let document = Persisted {
                version: STORAGE_VERSION,
                state: PersistedState {
                    favourites: inner.state.favourites.clone(),
                },
            };
            (storage, document)
        };
        let result = serde_json::to_string(&document)
            .map_err(std::io::Error::other)
            .and_then(|raw| storage.write(STORAGE_KEY, &raw));
        if let Err(e) = result {
            log::error!("Could not persist UI state: {e}");
        }
    }

    /// `None` goes back to the hub, where lists span every destination.
    pub fn set_active_direction(&self, direction_id: Option<String>) {
        self.update(|state| state.active_direction_id = direction_id);
    }

    pub fn set_search_query(&self, query: impl Into<String>) {
        let query = query.into();
        self.update(|state| state.search_query = query);
    }

    /// Adds `tag` to the selection, or removes it if already selected.
    pub fn toggle_tag(&self, tag: &str) {
        self.update(|state| {
            if let Some(index) = state.selected_tags.iter().position(|t| t == tag) {
                state.selected_tags.remove(index);
            } else {
                state.selected_tags.push(tag.to_string());
            }
        });
    }

    pub fn toggle_show_only_favourites(&self) {
        self.update(|state| state.show_only_favourites = !state.show_only_favourites);
    }

    pub fn set_login_prompt(&self, visible: bool) {
        self.update(|state| state.show_login_prompt = visible);
    }

    /// Flips the local favourite flag of `location_id` and returns the new value. A location
    /// without an entry counts as not favourited.
    pub fn toggle_favourite(&self, location_id: &str) -> bool {
        let mut now_favourite = false;
        self.update_persisted(|state| {
            let entry = state
                .favourites
                .entry(location_id.to_string())
                .or_insert(false);
            *entry = !*entry;
            now_favourite = *entry;
        });
        now_favourite
    }

    pub fn clear_favourite(&self, location_id: &str) {
        self.update_persisted(|state| {
            state.favourites.remove(location_id);
        });
    }

    /// Replaces the favourites map with exactly `location_ids`, as loaded for `user_id`.
    pub fn hydrate_favourites(&self, user_id: Option<&str>, location_ids: &[String]) {
        self.update_persisted(|state| {
            state.favourites = location_ids.iter().map(|id| (id.clone(), true)).collect();
            state.favourites_hydrated_for = user_id.map(str::to_string);
        });
    }

    pub fn is_favourite(&self, location_id: &str) -> bool {
        self.inner
            .borrow()
            .state
            .favourites
            .get(location_id)
            .copied()
            .unwrap_or(false)
    }

    /// The favourite status the UI shows. The local map wins; the server flag only counts while
    /// the map has neither an entry for the location nor been hydrated.
    pub fn effective_favourite(&self, location: &Location) -> bool {
        let inner = self.inner.borrow();
        let state = &inner.state;
        match state.favourites.get(&location.id) {
            Some(flag) => *flag,
            None if state.favourites_hydrated_for.is_some() => false,
            None => location.is_favourite.unwrap_or(false),
        }
    }
}
