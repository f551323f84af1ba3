//! Basemap tile cache command line.
//!
//! Builds georeferenced images from remote tile sources, seeds and purges
//! the local GeoPackage caches, and lists the available sources and grids.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use map_common::{BoundingBox, Crs};
use projection::EngineKind;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "basemap")]
#[command(about = "Download, cache and assemble web map tiles")]
struct Cli {
    /// Folder holding the tile caches
    #[arg(long, env = "BASEMAP_CACHE_DIR", default_value = "cache", global = true)]
    cache_dir: PathBuf,

    /// Catalog file with extra grids and sources
    #[arg(long, env = "BASEMAP_CATALOG", global = true)]
    catalog: Option<PathBuf>,

    /// Reprojection engine: auto, proj4, builtin or remote
    #[arg(long, env = "BASEMAP_ENGINE", default_value = "auto", global = true)]
    engine: EngineKind,

    /// Download timeout in seconds
    #[arg(long, default_value = "4", global = true)]
    timeout: u64,

    /// Age in days after which cached tiles are downloaded again
    #[arg(long, default_value = "90", global = true)]
    max_age: i64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where tiles come from and which grid they are served in.
#[derive(clap::Args, Debug, Clone)]
struct TileSource {
    /// Source key (see `basemap presets`)
    #[arg(short, long)]
    source: String,

    /// Layer key of the source
    #[arg(short, long)]
    layer: String,

    /// Serve tiles in this grid instead of the source grid
    #[arg(long)]
    dst_grid: Option<String>,

    /// Bypass the tile cache
    #[arg(long)]
    no_cache: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Assemble the tiles covering an extent into a georeferenced image
    Image {
        #[command(flatten)]
        tiles: TileSource,

        /// Extent as "minx,miny,maxx,maxy"
        #[arg(short, long, allow_hyphen_values = true)]
        bbox: BoundingBox,

        /// CRS of --bbox (defaults to the grid CRS)
        #[arg(long)]
        bbox_crs: Option<Crs>,

        /// Zoom level
        #[arg(short, long, conflicts_with = "res")]
        zoom: Option<u32>,

        /// Target resolution in grid units per pixel, mapped to the closest level
        #[arg(long)]
        res: Option<f64>,

        /// Reproject the image into this CRS
        #[arg(long)]
        out_crs: Option<Crs>,

        /// Discard the image when a tile is missing
        #[arg(long)]
        strict: bool,

        /// Concurrent downloads
        #[arg(short, long, default_value = "10")]
        threads: usize,

        /// Output image (.png or .jpg); a world file is written next to it
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Fetch a single tile
    Tile {
        #[command(flatten)]
        tiles: TileSource,

        #[arg(long)]
        col: i64,

        #[arg(long)]
        row: i64,

        #[arg(short, long)]
        zoom: u32,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Download every tile of an extent into the cache
    Seed {
        #[command(flatten)]
        tiles: TileSource,

        #[arg(short, long, allow_hyphen_values = true)]
        bbox: BoundingBox,

        #[arg(long)]
        bbox_crs: Option<Crs>,

        /// Zoom levels, as a list ("3,5,7") or a range ("0-12")
        #[arg(short, long)]
        zooms: commands::ZoomList,

        /// Download tiles again even when cached
        #[arg(long)]
        refresh: bool,

        #[arg(short, long, default_value = "10")]
        threads: usize,
    },

    /// Remove the tiles of an extent from the cache
    Purge {
        #[command(flatten)]
        tiles: TileSource,

        #[arg(short, long, allow_hyphen_values = true)]
        bbox: BoundingBox,

        #[arg(long)]
        bbox_crs: Option<Crs>,

        #[arg(short, long)]
        zooms: commands::ZoomList,
    },

    /// List the available sources and grids
    Presets {
        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr);
    if cli.log_json {
        tracing::subscriber::set_global_default(builder.with_thread_ids(true).json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    let settings = commands::Settings {
        cache_dir: cli.cache_dir,
        catalog: cli.catalog,
        engine: cli.engine,
        timeout: cli.timeout,
        max_age: cli.max_age,
    };

    match cli.command {
        Commands::Image {
            tiles,
            bbox,
            bbox_crs,
            zoom,
            res,
            out_crs,
            strict,
            threads,
            output,
        } => {
            let request = commands::ImageArgs {
                bbox,
                bbox_crs,
                zoom,
                res,
                out_crs,
                strict,
                threads,
                output,
            };
            commands::image(&settings, &tiles.into(), request).await
        }
        Commands::Tile {
            tiles,
            col,
            row,
            zoom,
            output,
        } => commands::tile(&settings, &tiles.into(), col, row, zoom, &output).await,
        Commands::Seed {
            tiles,
            bbox,
            bbox_crs,
            zooms,
            refresh,
            threads,
        } => {
            commands::seed(
                &settings,
                &tiles.into(),
                bbox,
                bbox_crs,
                &zooms,
                refresh,
                threads,
            )
            .await
        }
        Commands::Purge {
            tiles,
            bbox,
            bbox_crs,
            zooms,
        } => commands::purge(&settings, &tiles.into(), bbox, bbox_crs, &zooms).await,
        Commands::Presets { json } => commands::presets(&settings, json),
    }
}

impl From<TileSource> for commands::Target {
    fn from(args: TileSource) -> Self {
        Self {
            source: args.source,
            layer: args.layer,
            dst_grid: args.dst_grid,
            use_cache: !args.no_cache,
        }
    }
}
