//! Cache keys. Every list of locations lives under [`locations_root`], so one prefix reaches all
//! of its filter combinations.

use chokepoint::QueryKey;

/// Scope segment for lists that are not limited to a destination.
pub const UNSCOPED: &str = "__root__";

pub fn directions() -> QueryKey {
    QueryKey::new("directions")
}

pub fn locations_root() -> QueryKey {
    QueryKey::new("locations")
}

pub fn locations<S: AsRef<str>>(direction_id: Option<&str>, search: &str, tags: &[S]) -> QueryKey {
    locations_root()
        .with(direction_id.unwrap_or(UNSCOPED))
        .with(search)
        .with_list(tags)
}

pub fn location(id: &str) -> QueryKey {
    QueryKey::new("location").with(id)
}

pub fn tags() -> QueryKey {
    QueryKey::new("tags")
}

pub fn favourites_root() -> QueryKey {
    QueryKey::new("favourites")
}

pub fn favourites(user_id: &str) -> QueryKey {
    favourites_root().with(user_id)
}

pub fn location_count(direction_id: &str) -> QueryKey {
    QueryKey::new("locationCount").with(direction_id)
}

pub fn locations_for_card(direction_id: &str) -> QueryKey {
    QueryKey::new("locationsForCard").with(direction_id)
}
