use std::time::Instant;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use lazytile::domain::ImageLoaderPort;
use lazytile::infrastructure::{AppConfig, CliArgs, ConfigStore, ImageLoader};
use lazytile::presentation::{TileGrid, TileSummary};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = &config.log_path {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let store = ConfigStore::new()?;
    let mut config = store
        .load_config(args.config.as_deref())
        .wrap_err("failed to load configuration")?;
    config.merge_with_args(args);
    Ok(config)
}

fn print_table(rows: &[TileSummary]) {
    println!(
        "{:<6} {:<8} {:>11} {:<8} URL",
        "SLOT", "STATUS", "SIZE", "SOURCE"
    );
    for row in rows {
        let size = match (row.width, row.height) {
            (Some(w), Some(h)) => format!("{w}x{h}"),
            _ => "-".to_string(),
        };
        let detail = row
            .error
            .as_ref()
            .map_or_else(String::new, |e| format!("  ({e})"));
        println!(
            "{:<6} {:<8} {:>11} {:<8} {}{}",
            row.slot,
            row.status,
            size,
            row.source.as_deref().unwrap_or("-"),
            row.url.as_deref().unwrap_or("-"),
            detail
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = lazytile::VERSION, "Starting {}", lazytile::NAME);

    let (loader, mut queue) = ImageLoader::with_defaults(&config.loader).await?;
    if let Some(dir) = loader.disk_cache().map(|disk| disk.cache_dir().to_path_buf()) {
        info!(dir = %dir.display(), "Using disk cache");
    }

    if args.clear_cache && !loader.clear_cache().await {
        warn!("Some cache files could not be removed");
    }

    let slot_count = args.slots.unwrap_or(args.urls.len() as u64).max(1);
    let mut grid = TileGrid::new(slot_count);
    let started = Instant::now();

    for (index, url) in args.urls.iter().enumerate() {
        let Some(slot) = grid.slot_for(index) else {
            continue;
        };
        grid.assign(slot, url);
        let state = loader.load(url, slot, &mut grid);
        grid.note_load_state(slot, state);
    }

    queue.dispatch_until_idle(&mut grid).await;
    loader.cancel_all();

    info!(
        ready = grid.ready_count(),
        slots = grid.len(),
        elapsed_ms = started.elapsed().as_millis(),
        memory = %loader.memory_cache_stats(),
        "Finished loading"
    );

    let rows = grid.summary();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print_table(&rows);
    }

    Ok(())
}
