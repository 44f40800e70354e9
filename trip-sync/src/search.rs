use chrono::{DateTime, TimeDelta, Utc};

use crate::filter_state::UiStore;

/// Holds what the user is typing and commits it to the store's search query once typing has
/// paused for the quiet period.
///
/// The debouncer is driven by the caller's clock: call [`SearchDebouncer::tick`] whenever time
/// passes, e.g. when [`SearchDebouncer::deadline`] is reached.
pub struct SearchDebouncer {
    store: UiStore,
    quiet: TimeDelta,
    input: String,
    last_typed_at: Option<DateTime<Utc>>,
    committed: String,
}

impl SearchDebouncer {
    pub fn new(store: UiStore, quiet: TimeDelta) -> Self {
        let committed = store.search_query();
        Self {
            store,
            quiet,
            input: committed.clone(),
            last_typed_at: None,
            committed,
        }
    }

    pub fn input(&mut self) -> &str {
        self.resync();
        &self.input
    }

    pub fn type_text(&mut self, text: impl Into<String>, now: DateTime<Utc>) {
        self.resync();
        self.input = text.into();
        self.last_typed_at = Some(now);
    }

    /// When the pending input will be committed, if there is any.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.last_typed_at.map(|typed_at| typed_at + self.quiet)
    }

    /// Commits the input if the quiet period has elapsed. Returns whether the search query
    /// changed.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        self.resync();
        let Some(deadline) = self.deadline() else {
            return false;
        };
        if now < deadline {
            return false;
        }
        self.last_typed_at = None;
        if self.input == self.committed {
            return false;
        }
        log::debug!("Committing search {:?}", self.input);
        self.store.set_search_query(self.input.clone());
        self.committed = self.input.clone();
        true
    }

    /// Follows changes made to the search query by someone else, dropping pending input.
    fn resync(&mut self) {
        let current = self.store.search_query();
        if current != self.committed {
            self.input = current.clone();
            self.committed = current;
            self.last_typed_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commits_after_quiet_period() {
        let store = UiStore::new();
        let mut debouncer = SearchDebouncer::new(store.clone(), TimeDelta::seconds(1));
        let t0 = Utc::now();

        debouncer.type_text("nar", t0);
        debouncer.type_text("narikala", t0 + TimeDelta::milliseconds(600));
        assert!(!debouncer.tick(t0 + TimeDelta::milliseconds(1200)));
        assert_eq!(store.search_query(), "");

        assert!(debouncer.tick(t0 + TimeDelta::milliseconds(1600)));
        assert_eq!(store.search_query(), "narikala");
        assert_eq!(debouncer.deadline(), None);
    }

    #[test]
    fn test_unchanged_input_is_not_committed() {
        let store = UiStore::new();
        store.set_search_query("baths");
        let mut debouncer = SearchDebouncer::new(store.clone(), TimeDelta::seconds(1));
        let t0 = Utc::now();
        debouncer.type_text("bath", t0);
        debouncer.type_text("baths", t0);
        assert!(!debouncer.tick(t0 + TimeDelta::seconds(2)));
    }

    #[test]
    fn test_external_change_replaces_input() {
        let store = UiStore::new();
        let mut debouncer = SearchDebouncer::new(store.clone(), TimeDelta::seconds(1));
        let t0 = Utc::now();
        debouncer.type_text("old", t0);

        store.set_search_query("");
        store.set_search_query("fortress");
        assert_eq!(debouncer.input(), "fortress");
        assert!(!debouncer.tick(t0 + TimeDelta::seconds(5)));
        assert_eq!(store.search_query(), "fortress");
    }
}
