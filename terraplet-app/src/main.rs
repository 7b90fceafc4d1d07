use std::sync::Arc;
use std::time::{Duration, Instant};

use terraplet::{
    prelude::{HttpFetcher, TilePool, UrlTemplateSource},
    DataChannel, MapConfig, MapController, RangeTileProvider, TileDataLoader,
};

const DEFAULT_RUN_SECONDS: u64 = 20;

/// Streams tiles around the configured origin and reports the height snap.
///
/// Usage: `terraplet-app [config.json] [seconds]`
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    terraplet::init_logger();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => MapConfig::from_json_file(&path)?,
        None => MapConfig::default(),
    };
    let run_for = Duration::from_secs(
        args.next()
            .map(|s| s.parse::<u64>())
            .transpose()?
            .unwrap_or(DEFAULT_RUN_SECONDS),
    );

    let fetcher = HttpFetcher::new()
        .with_timeout(Duration::from_millis(config.loading.request_timeout_ms))
        .with_source(DataChannel::Height, elevation_source())
        .with_source(DataChannel::Raster, UrlTemplateSource::openstreetmap());
    let loader = TileDataLoader::new(Arc::new(fetcher), config.loading.clone())
        .with_channels([DataChannel::Height, DataChannel::Raster]);

    let mut controller = MapController::new(
        config,
        Box::new(TilePool::with_capacity(9)),
        Box::new(RangeTileProvider::square(1)),
    )
    .with_loader(loader);
    controller.on_initialized(|origin| {
        log::info!("origin tile {} ready", origin.center_tile);
    });
    controller.initialize()?;

    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                break;
            }
        }

        controller.pump();
        if controller.height_snapped() || started.elapsed() >= run_for {
            break;
        }
    }

    let root = controller.root_position();
    if controller.height_snapped() {
        log::info!("map root offset: ({:.4}, {:.4}, {:.4})", root.x, root.y, root.z);
    } else {
        log::warn!("no elevation arrived within {:?}", run_for);
    }

    controller.teardown();
    Ok(())
}

/// Terrain-RGB tile source. `TERRAPLET_ELEVATION_URL` replaces the Mapbox
/// template; `TERRAPLET_TOKEN` fills `{token}`.
fn elevation_source() -> UrlTemplateSource {
    let token = std::env::var("TERRAPLET_TOKEN").unwrap_or_default();
    match std::env::var("TERRAPLET_ELEVATION_URL") {
        Ok(template) => UrlTemplateSource::new(template).with_token(token),
        Err(_) => UrlTemplateSource::mapbox_terrain_rgb(token),
    }
}
