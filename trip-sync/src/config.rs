use std::path::PathBuf;

use chrono::TimeDelta;

/// Tunables of the sync layer. Stale times are in seconds.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: usize,
    pub locations_stale_secs: i64,
    pub location_stale_secs: i64,
    pub directions_stale_secs: i64,
    pub tags_stale_secs: i64,
    pub location_count_stale_secs: i64,
    pub card_sample_stale_secs: i64,
    pub search_debounce_ms: i64,
    /// How many locations a destination card shows.
    pub card_sample_size: usize,
    /// How many locations the card sample is drawn from.
    pub card_pool_size: usize,
    /// Where UI state is persisted. `None` keeps it in memory.
    pub state_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 9,
            locations_stale_secs: 60,
            location_stale_secs: 60,
            directions_stale_secs: 60,
            tags_stale_secs: 5 * 60,
            location_count_stale_secs: 60,
            card_sample_stale_secs: 5 * 60,
            search_debounce_ms: 1000,
            card_sample_size: 3,
            card_pool_size: 10,
            state_dir: None,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `TRIP_PAGE_SIZE`, `TRIP_STATE_DIR` and `TRIP_SEARCH_DEBOUNCE_MS`.
    /// Unparseable numbers are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(page_size) = parse_var("TRIP_PAGE_SIZE") {
            config.page_size = page_size;
        }
        if let Some(debounce) = parse_var("TRIP_SEARCH_DEBOUNCE_MS") {
            config.search_debounce_ms = debounce;
        }
        if let Ok(dir) = std::env::var("TRIP_STATE_DIR") {
            config.state_dir = Some(PathBuf::from(dir));
        }
        config
    }

    pub fn locations_stale(&self) -> TimeDelta {
        TimeDelta::seconds(self.locations_stale_secs)
    }

    pub fn location_stale(&self) -> TimeDelta {
        TimeDelta::seconds(self.location_stale_secs)
    }

    pub fn directions_stale(&self) -> TimeDelta {
        TimeDelta::seconds(self.directions_stale_secs)
    }

    pub fn tags_stale(&self) -> TimeDelta {
        TimeDelta::seconds(self.tags_stale_secs)
    }

    pub fn location_count_stale(&self) -> TimeDelta {
        TimeDelta::seconds(self.location_count_stale_secs)
    }

    pub fn card_sample_stale(&self) -> TimeDelta {
        TimeDelta::seconds(self.card_sample_stale_secs)
    }

    pub fn search_debounce(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.search_debounce_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {name}={raw:?}: not a number");
            None
        }
    }
}
