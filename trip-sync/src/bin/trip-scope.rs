use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use futures::future::LocalBoxFuture;
use supaclient::memory::MemoryBackend;
use supaclient::{Backend, Filter, RemoteDataService, Row};
use trip_sync::models::{ImageFile, LocationDraft, NewDestination};
use trip_sync::persistence::FileStorage;
use trip_sync::{LocationFeed, SyncConfig, TripSync, UiStore, UsernameSession};

#[derive(Parser, Debug)]
#[command(version, about = "Inspect the trip planner's sync layer", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scripted session against an in-memory backend and print what the caches see
    Demo {
        /// User to sign in as
        #[arg(short, long, default_value = "alice")]
        user: String,

        /// Number of locations to create
        #[arg(short, long, default_value_t = 12)]
        locations: usize,
    },
    /// Page through the locations of a destination on a Supabase project
    ///
    /// The Supabase client speaks REST only and has no realtime transport, so the feed is a
    /// one-off read: changes made by others are not patched in while it runs.
    #[cfg(feature = "supabase")]
    List {
        /// Destination id
        direction: String,

        /// Only show locations whose title contains this text
        #[arg(short, long, default_value = "")]
        search: String,

        /// Only show locations with any of these tags
        #[arg(short, long, num_args = 1..)]
        tag: Vec<String>,
    },
}

fn spawner() -> chokepoint::Spawner {
    Rc::new(|fut: LocalBoxFuture<'static, ()>| {
        tokio::task::spawn_local(fut);
    })
}

fn ui_store(config: &SyncConfig) -> UiStore {
    match &config.state_dir {
        Some(dir) => UiStore::load(Rc::new(FileStorage::new(dir.clone()))),
        None => UiStore::new(),
    }
}

fn print_feed(feed: &LocationFeed) {
    for (number, page) in feed.pages.iter().enumerate() {
        println!("page {} ({} locations)", number + 1, page.items.len());
        for item in &page.items {
            println!(
                "  {}  {:<24} [{}]",
                item.created_at.format("%H:%M:%S%.6f"),
                item.title,
                item.tags.join(", ")
            );
        }
    }
    if !feed.has_next_page() {
        println!("(end of feed)");
    }
}

fn print_notices<B: Backend + 'static>(sync: &TripSync<B>) {
    for notice in sync.drain_notices() {
        println!("[{:?}] {}", notice.level, notice.message);
    }
}

async fn demo(user: &str, location_count: usize, config: SyncConfig) -> Result<()> {
    let backend = Rc::new(MemoryBackend::new());
    let session = Rc::new(UsernameSession::new(backend.clone()));
    let sync = TripSync::new(
        backend.clone(),
        session.clone(),
        ui_store(&config),
        config,
        spawner(),
    );

    session.sign_in(user).await?;
    sync.sync_favourites().await?;
    sync.prefetch_tags().await;

    let destination = sync
        .add_destination(NewDestination {
            title: "Tbilisi".into(),
            country: "Georgia".into(),
            city: Some("Tbilisi".into()),
            cover: Some(ImageFile {
                name: "tbilisi.png".into(),
                content_type: "image/png".into(),
                bytes: b"\x89PNG".to_vec(),
            }),
        })
        .await?;
    println!("created {} ({})", destination.title, destination.id);
    sync.store().set_active_direction(Some(destination.id.clone()));

    let tag_cycle = [["food", "old town"], ["hiking", "views"], ["food", "views"]];
    for n in 0..location_count {
        sync.add_location(LocationDraft {
            title: format!("Spot {}", n + 1),
            tags: tag_cycle[n % tag_cycle.len()].into(),
            ..Default::default()
        })
        .await?;
    }
    print_notices(&sync);

    let _live = sync.watch_locations();

    let first = sync.locations().await?;
    print_feed(&first);
    let all = sync.fetch_next_locations().await?;
    print_feed(&all);

    // Another client renames the newest spot; the cached feed follows without a refetch.
    let newest = first
        .pages
        .first()
        .and_then(|page| page.items.first())
        .ok_or_else(|| anyhow!("the feed is empty"))?;
    let mut patch = Row::new();
    patch.insert("title".into(), "Narikala Fortress".into());
    backend
        .update("locations", patch, vec![Filter::eq("id", newest.id.as_str())])
        .await?;
    let filter = sync.current_filter();
    if let Some(feed) = sync.cache().get_data::<LocationFeed>(&filter.key()) {
        println!("after realtime update:");
        print_feed(&feed);
    }

    let favourite = sync.toggle_favourite(&newest.id).await?;
    println!("{} is favourite: {favourite}", newest.id);

    sync.store().toggle_tag("hiking");
    let hiking = sync.locations().await?;
    println!("tagged hiking:");
    print_feed(&hiking);

    print_notices(&sync);
    Ok(())
}

#[cfg(feature = "supabase")]
async fn list(direction: String, search: String, tags: Vec<String>, config: SyncConfig) -> Result<()> {
    use supaclient::supabase::{SupabaseClient, SupabaseConfig};
    use trip_sync::LocationFilter;

    let client = Rc::new(SupabaseClient::new(
        SupabaseConfig::from_env().context("Supabase is not configured")?,
    ));
    let session = Rc::new(UsernameSession::new(client.clone()));
    let sync = TripSync::new(client, session, ui_store(&config), config, spawner());

    let filter = LocationFilter {
        direction_id: Some(direction),
        search,
        tags,
    };
    let mut feed = sync.locations_for(filter.clone()).await?;
    while feed.has_next_page() {
        feed = sync.fetch_next_locations_for(filter.clone()).await?;
    }
    print_feed(&feed);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let config = SyncConfig::from_env();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            match args.command {
                Command::Demo { user, locations } => demo(&user, locations, config)
                    .await
                    .context("demo session failed"),
                #[cfg(feature = "supabase")]
                Command::List {
                    direction,
                    search,
                    tag,
                } => list(direction, search, tag, config).await,
            }
        })
        .await
}
