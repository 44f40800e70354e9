mod common;

use std::collections::BTreeSet;

use common::{Harness, row};
use serde_json::json;
use supaclient::{Filter, RemoteDataService};
use trip_sync::{LocationFeed, LocationFilter};

fn tbilisi_with_twelve() -> Harness {
    let h = Harness::new();
    h.seed_direction("tbilisi", "alice");
    h.seed_direction("batumi", "alice");
    for n in 1..=12 {
        h.add_spot("tbilisi", &format!("Spot {n}"), &[]);
    }
    h.add_spot("batumi", "Seaside boulevard", &[]);
    h.sync.store().set_active_direction(Some("tbilisi".into()));
    h
}

fn titles(feed: &LocationFeed) -> Vec<String> {
    feed.pages
        .iter()
        .flat_map(|page| page.items.iter().map(|item| item.title.clone()))
        .collect()
}

#[test]
fn test_twelve_locations_page_as_nine_then_three() {
    let h = tbilisi_with_twelve();

    let first = h.run(h.sync.locations()).unwrap();
    assert_eq!(first.pages.len(), 1);
    let page = &first.pages[0];
    assert_eq!(page.items.len(), 9);
    assert_eq!(page.items[0].title, "Spot 12");
    assert_eq!(page.next_cursor, Some(page.items[8].created_at));
    assert!(first.has_next_page());

    let all = h.run(h.sync.fetch_next_locations()).unwrap();
    assert_eq!(all.pages.len(), 2);
    assert_eq!(all.pages[1].items.len(), 3);
    assert_eq!(all.pages[1].next_cursor, None);
    assert!(!all.has_next_page());

    let expected: Vec<String> = (1..=12).rev().map(|n| format!("Spot {n}")).collect();
    assert_eq!(titles(&all), expected);
}

#[test]
fn test_pages_never_repeat_or_skip_rows() {
    let h = tbilisi_with_twelve();
    h.run(h.sync.locations()).unwrap();
    let all = h.run(h.sync.fetch_next_locations()).unwrap();

    let items: Vec<_> = all.pages.iter().flat_map(|page| page.items.iter()).collect();
    let ids: BTreeSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids.len(), 12);
    for pair in items.windows(2) {
        assert!(pair[0].created_at > pair[1].created_at);
    }
    assert!(items.iter().all(|item| item.direction_id == "tbilisi"));
}

#[test]
fn test_fetching_past_the_end_is_a_no_op() {
    let h = tbilisi_with_twelve();
    h.run(h.sync.locations()).unwrap();
    h.run(h.sync.fetch_next_locations()).unwrap();

    let (feed, calls) = h.calls_during(h.sync.fetch_next_locations());
    assert_eq!(feed.unwrap().pages.len(), 2);
    assert!(calls.is_empty(), "unexpected calls: {calls:?}");
}

#[test]
fn test_hub_feed_spans_every_destination() {
    let h = tbilisi_with_twelve();
    let feed = h
        .run(h.sync.locations_for(LocationFilter::default()))
        .unwrap();
    assert_eq!(feed.pages[0].items[0].title, "Seaside boulevard");
}

#[test]
fn test_tag_filter_matches_any_selected_tag() {
    let h = Harness::new();
    h.seed_direction("tbilisi", "alice");
    h.add_spot("tbilisi", "Beach bar", &["beach", "food"]);
    h.add_spot("tbilisi", "Kazbegi trail", &["hiking"]);
    h.add_spot("tbilisi", "National museum", &["museum"]);

    h.sync.store().toggle_tag("beach");
    h.sync.store().toggle_tag("hiking");
    let feed = h.run(h.sync.locations()).unwrap();

    assert_eq!(titles(&feed), vec!["Kazbegi trail", "Beach bar"]);
    let mut bar_tags = feed.pages[0].items[1].tags.clone();
    bar_tags.sort();
    assert_eq!(bar_tags, vec!["beach", "food"]);
}

#[test]
fn test_unknown_tag_yields_empty_page_without_querying_locations() {
    let h = Harness::new();
    h.seed_direction("tbilisi", "alice");
    h.add_spot("tbilisi", "Beach bar", &["beach"]);
    h.sync.store().toggle_tag("volcano");

    let (feed, calls) = h.calls_during(h.sync.locations());
    let feed = feed.unwrap();
    assert!(feed.pages[0].items.is_empty());
    assert!(!feed.has_next_page());
    assert!(!calls.iter().any(|call| call == "select:locations"));
}

#[test]
fn test_toggling_a_tag_twice_returns_to_the_cached_feed() {
    let h = tbilisi_with_twelve();
    let before = h.sync.current_filter();
    h.run(h.sync.locations()).unwrap();

    h.sync.store().toggle_tag("food");
    h.sync.store().toggle_tag("food");
    assert_eq!(h.sync.current_filter(), before);

    let (feed, calls) = h.calls_during(h.sync.locations());
    assert_eq!(feed.unwrap().pages[0].items.len(), 9);
    assert!(calls.is_empty(), "fresh feed was refetched: {calls:?}");
}

#[test]
fn test_search_matches_title_substring_ignoring_case() {
    let h = Harness::new();
    h.seed_direction("tbilisi", "alice");
    h.add_spot("tbilisi", "Narikala Fortress", &[]);
    h.add_spot("tbilisi", "Sulfur baths", &[]);
    h.sync.store().set_search_query("FORT");

    let feed = h.run(h.sync.locations()).unwrap();
    assert_eq!(titles(&feed), vec!["Narikala Fortress"]);
}

#[test]
fn test_realtime_update_patches_feed_without_refetching() {
    let h = tbilisi_with_twelve();
    h.add_spot("tbilisi", "Narikala", &["views"]);
    let _live = h.sync.watch_locations().unwrap();
    let feed = h.run(h.sync.locations()).unwrap();
    let id = feed.pages[0].items[0].id.clone();

    let (updated, calls) = h.calls_during(h.backend.update(
        "locations",
        row(json!({"title": "Narikala Fortress"})),
        vec![Filter::eq("id", id.as_str())],
    ));
    updated.unwrap();
    assert_eq!(calls, vec!["update:locations"]);

    let key = h.sync.current_filter().key();
    let cached = h.sync.cache().get_data::<LocationFeed>(&key).unwrap();
    let patched = &cached.pages[0].items[0];
    assert_eq!(patched.title, "Narikala Fortress");
    assert_eq!(patched.tags, vec!["views"]);
    assert_eq!(patched.created_at, feed.pages[0].items[0].created_at);
    assert_eq!(cached.pages[0].items[1..], feed.pages[0].items[1..]);
    assert_eq!(cached.page_params, feed.page_params);
    assert!(!h.sync.cache().is_invalidated(&key));
}

#[test]
fn test_realtime_delete_removes_the_row_from_cached_feeds() {
    let h = tbilisi_with_twelve();
    let _live = h.sync.watch_locations().unwrap();
    let feed = h.run(h.sync.locations()).unwrap();
    let doomed = feed.pages[0].items[3].id.clone();

    h.run(h.backend.delete("locations", vec![Filter::eq("id", doomed.as_str())]))
        .unwrap();

    let key = h.sync.current_filter().key();
    let cached = h.sync.cache().get_data::<LocationFeed>(&key).unwrap();
    assert_eq!(cached.pages[0].items.len(), 8);
    assert!(cached.pages[0].items.iter().all(|item| item.id != doomed));
}

#[test]
fn test_realtime_insert_invalidates_every_feed() {
    let h = tbilisi_with_twelve();
    let _live = h.sync.watch_locations().unwrap();
    h.run(h.sync.locations()).unwrap();
    h.run(h.sync.locations_for(LocationFilter::default())).unwrap();

    h.add_spot("tbilisi", "Fabrika", &[]);

    assert!(h.sync.cache().is_invalidated(&h.sync.current_filter().key()));
    assert!(h.sync.cache().is_invalidated(&LocationFilter::default().key()));
    let feed = h.run(h.sync.locations()).unwrap();
    assert_eq!(feed.pages[0].items[0].title, "Fabrika");
}

#[test]
fn test_next_page_after_insert_reloads_from_the_top() {
    let h = tbilisi_with_twelve();
    let _live = h.sync.watch_locations().unwrap();
    h.run(h.sync.locations()).unwrap();

    h.add_spot("tbilisi", "Fabrika", &[]);
    let feed = h.run(h.sync.fetch_next_locations()).unwrap();

    assert!(!h.sync.cache().is_invalidated(&h.sync.current_filter().key()));
    assert_eq!(feed.pages.len(), 2);
    assert_eq!(feed.pages[0].items.len(), 9);
    assert_eq!(feed.pages[0].items[0].title, "Fabrika");
    assert_eq!(feed.pages[1].items.len(), 4);
    let mut expected = vec!["Fabrika".to_string()];
    expected.extend((1..=12).rev().map(|n| format!("Spot {n}")));
    assert_eq!(titles(&feed), expected);
}

#[test]
fn test_search_debouncer_commits_after_configured_pause() {
    let h = Harness::new();
    let mut debouncer = h.sync.search_debouncer();
    let typed_at = chrono::Utc::now();

    debouncer.type_text("fort", typed_at);
    assert_eq!(
        debouncer.deadline(),
        Some(typed_at + h.sync.config().search_debounce())
    );
    assert!(!debouncer.tick(typed_at + chrono::TimeDelta::milliseconds(999)));
    assert_eq!(h.sync.store().search_query(), "");

    assert!(debouncer.tick(typed_at + chrono::TimeDelta::seconds(1)));
    assert_eq!(h.sync.store().search_query(), "fort");
    assert_eq!(h.sync.current_filter().search, "fort");
}

#[test]
fn test_dropped_subscription_stops_patching() {
    let h = tbilisi_with_twelve();
    let live = h.sync.watch_locations().unwrap();
    assert_eq!(h.backend.subscriber_count(), 1);
    drop(live);
    assert_eq!(h.backend.subscriber_count(), 0);
}

#[test]
fn test_watch_reports_closed_channel_as_none() {
    let h = Harness::new();
    h.backend.disconnect_realtime();
    assert!(h.sync.watch_locations().is_none());
}

#[test]
fn test_favourites_only_view_uses_local_flags() {
    let h = Harness::signed_in("alice");
    h.seed_direction("tbilisi", "alice");
    let kept = h.add_spot("tbilisi", "Narikala", &[]);
    h.add_spot("tbilisi", "Sulfur baths", &[]);
    h.sync.store().set_active_direction(Some("tbilisi".into()));

    h.run(h.sync.toggle_favourite(&kept.id)).unwrap();
    h.sync.store().toggle_show_only_favourites();
    let feed = h.run(h.sync.locations()).unwrap();

    let visible = h.sync.visible_locations(&feed);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, kept.id);
    assert_eq!(visible[0].is_favourite, Some(true));
}
