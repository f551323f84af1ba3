//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use map_common::{BoundingBox, Crs};
use map_service::{Catalog, ImageRequest, MapService, ServiceConfig};
use projection::{EngineKind, ProjectionConfig};
use raster::TileFormat;
use tile_grid::NearestRule;
use tracing::info;

/// How often the progress line is refreshed.
const REPORT_INTERVAL: Duration = Duration::from_millis(250);

/// Options shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache_dir: PathBuf,
    pub catalog: Option<PathBuf>,
    pub engine: EngineKind,
    pub timeout: u64,
    pub max_age: i64,
}

impl Settings {
    fn catalog(&self) -> Result<Catalog> {
        let catalog = match &self.catalog {
            Some(path) => Catalog::load(path)
                .with_context(|| format!("Failed to load catalog {}", path.display()))?,
            None => Catalog::builtin()?,
        };
        Ok(catalog)
    }

    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            max_age_days: self.max_age,
            download_timeout_secs: self.timeout,
            projection: ProjectionConfig {
                engine: self.engine,
                ..ProjectionConfig::default()
            },
            ..ServiceConfig::default()
        }
    }
}

/// Source, layer and grid a command works on.
#[derive(Debug, Clone)]
pub struct Target {
    pub source: String,
    pub layer: String,
    pub dst_grid: Option<String>,
    pub use_cache: bool,
}

impl Target {
    fn to_dst_grid(&self) -> bool {
        self.dst_grid.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ImageArgs {
    pub bbox: BoundingBox,
    pub bbox_crs: Option<Crs>,
    pub zoom: Option<u32>,
    pub res: Option<f64>,
    pub out_crs: Option<Crs>,
    pub strict: bool,
    pub threads: usize,
    pub output: PathBuf,
}

/// Zoom levels given as `3,5,7`, `0-12` or a mix of both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoomList(pub Vec<u32>);

impl FromStr for ZoomList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut zooms = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((from, to)) => {
                    let from: u32 = from
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid zoom range '{}'", part))?;
                    let to: u32 = to
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid zoom range '{}'", part))?;
                    if from > to {
                        return Err(format!("invalid zoom range '{}'", part));
                    }
                    zooms.extend(from..=to);
                }
                None => zooms.push(
                    part.parse()
                        .map_err(|_| format!("invalid zoom level '{}'", part))?,
                ),
            }
        }
        if zooms.is_empty() {
            return Err("no zoom level given".to_string());
        }
        zooms.sort_unstable();
        zooms.dedup();
        Ok(ZoomList(zooms))
    }
}

async fn open_service(settings: &Settings, target: &Target) -> Result<MapService> {
    let mut builder = MapService::builder(&target.source, &settings.cache_dir)
        .catalog(settings.catalog()?)
        .config(settings.service_config());
    if let Some(grid) = &target.dst_grid {
        builder = builder.dst_grid(grid.clone());
    }
    let service = builder
        .build()
        .await
        .with_context(|| format!("Failed to open source {}", target.source))?;
    // Validate the layer before any work starts
    service.layer(&target.layer)?;
    Ok(service)
}

/// Express `bbox` in the CRS of the working grid.
async fn grid_bbox(
    service: &MapService,
    target: &Target,
    bbox: BoundingBox,
    bbox_crs: Option<&Crs>,
) -> Result<BoundingBox> {
    let tm = service.get_tm(target.to_dst_grid())?;
    match bbox_crs {
        Some(crs) if crs != tm.crs() => {
            let reproj = service.engine().get(crs, tm.crs()).await?;
            let out = reproj.bbox(&bbox).await?;
            info!(from = %crs, to = %tm.crs(), bbox = ?out, "Extent reprojected");
            Ok(out)
        }
        _ => Ok(bbox),
    }
}

/// Print the service report on stderr whenever it changes, and stop the
/// service on Ctrl-C.
fn watch(service: &MapService) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let reporter = {
        let service = service.clone();
        tokio::spawn(async move {
            let mut last = String::new();
            loop {
                let report = service.report();
                if report != last {
                    if !report.is_empty() {
                        eprintln!("{}", report);
                    }
                    last = report;
                }
                tokio::time::sleep(REPORT_INTERVAL).await;
            }
        })
    };
    let interrupt = {
        let service = service.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, stopping");
                service.stop();
            }
        })
    };
    (reporter, interrupt)
}

fn output_format(path: &Path) -> Result<TileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| anyhow!("output {} has no extension", path.display()))?;
    TileFormat::parse(ext).ok_or_else(|| anyhow!("unsupported output format '{}'", ext))
}

/// `image.png` -> `image.pgw`, `image.jpg` -> `image.jgw`.
fn world_file_path(path: &Path) -> PathBuf {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let mut chars = ext.chars();
    let world_ext = match (chars.next(), chars.last()) {
        (Some(first), Some(last)) => format!("{}{}w", first, last),
        _ => "wld".to_string(),
    };
    path.with_extension(world_ext)
}

pub async fn image(settings: &Settings, target: &Target, args: ImageArgs) -> Result<()> {
    let format = output_format(&args.output)?;
    let service = open_service(settings, target).await?;
    let bbox = grid_bbox(&service, target, args.bbox, args.bbox_crs.as_ref()).await?;

    let tm = service.get_tm(target.to_dst_grid())?;
    let zoom = match (args.zoom, args.res) {
        (Some(zoom), _) => zoom,
        (None, Some(res)) => tm.get_nearest_zoom(res, NearestRule::Closer),
        (None, None) => bail!("either --zoom or --res is required"),
    };

    let opts = ImageRequest {
        to_dst_grid: target.to_dst_grid(),
        use_cache: target.use_cache,
        nb_threads: args.threads,
        out_crs: args.out_crs,
        allow_empty_tile: !args.strict,
    };

    let (reporter, interrupt) = watch(&service);
    let result = service.get_image(&target.layer, &bbox, zoom, &opts).await;
    reporter.abort();
    interrupt.abort();

    let img = match result? {
        Some(img) => img,
        None => bail!("no image built (interrupted, or tiles missing in strict mode)"),
    };

    tokio::fs::write(&args.output, img.encode(format)?)
        .await
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    let world = world_file_path(&args.output);
    tokio::fs::write(&world, img.world_file()).await?;

    info!(
        output = %args.output.display(),
        width = img.width(),
        height = img.height(),
        zoom,
        "Image written"
    );
    Ok(())
}

pub async fn tile(
    settings: &Settings,
    target: &Target,
    col: i64,
    row: i64,
    zoom: u32,
    output: &Path,
) -> Result<()> {
    let service = open_service(settings, target).await?;
    let data = service
        .get_tile(
            &target.layer,
            col,
            row,
            zoom,
            target.to_dst_grid(),
            target.use_cache,
        )
        .await?
        .ok_or_else(|| anyhow!("tile {}/{}/{} unavailable", zoom, col, row))?;

    tokio::fs::write(output, &data)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(output = %output.display(), bytes = data.len(), "Tile written");
    Ok(())
}

pub async fn seed(
    settings: &Settings,
    target: &Target,
    bbox: BoundingBox,
    bbox_crs: Option<Crs>,
    zooms: &ZoomList,
    refresh: bool,
    threads: usize,
) -> Result<()> {
    let service = open_service(settings, target).await?;
    let bbox = grid_bbox(&service, target, bbox, bbox_crs.as_ref()).await?;

    let (reporter, interrupt) = watch(&service);
    let result = service
        .seed_cache(
            &target.layer,
            &bbox,
            &zooms.0,
            target.to_dst_grid(),
            threads,
            refresh,
        )
        .await;
    reporter.abort();
    interrupt.abort();

    let summary = result?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

pub async fn purge(
    settings: &Settings,
    target: &Target,
    bbox: BoundingBox,
    bbox_crs: Option<Crs>,
    zooms: &ZoomList,
) -> Result<()> {
    let service = open_service(settings, target).await?;
    let bbox = grid_bbox(&service, target, bbox, bbox_crs.as_ref()).await?;
    let deleted = service
        .purge_cache(&target.layer, &bbox, &zooms.0, target.to_dst_grid())
        .await?;
    println!("{} tiles deleted", deleted);
    Ok(())
}

pub fn presets(settings: &Settings, json: bool) -> Result<()> {
    let catalog = settings.catalog()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }

    println!("Grids:");
    for (key, grid) in &catalog.grids {
        println!("  {:<12} {:<12} {}", key, grid.crs.to_string(), grid.name);
    }
    println!("Sources:");
    for (key, source) in &catalog.sources {
        let layers: Vec<&str> = source.layers.keys().map(String::as_str).collect();
        println!(
            "  {:<12} {:<5} {:<12} {}",
            key,
            source.service.as_str(),
            source.grid,
            layers.join(",")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zoom_list() {
        assert_eq!("3".parse::<ZoomList>().unwrap(), ZoomList(vec![3]));
        assert_eq!(
            "7, 3,5".parse::<ZoomList>().unwrap(),
            ZoomList(vec![3, 5, 7])
        );
        assert_eq!(
            "0-2,2,4".parse::<ZoomList>().unwrap(),
            ZoomList(vec![0, 1, 2, 4])
        );
        assert!("5-2".parse::<ZoomList>().is_err());
        assert!("a".parse::<ZoomList>().is_err());
        assert!("".parse::<ZoomList>().is_err());
    }

    #[test]
    fn test_world_file_path() {
        assert_eq!(
            world_file_path(Path::new("out/map.png")),
            PathBuf::from("out/map.pgw")
        );
        assert_eq!(
            world_file_path(Path::new("map.jpg")),
            PathBuf::from("map.jgw")
        );
        assert_eq!(
            world_file_path(Path::new("map.jpeg")),
            PathBuf::from("map.jgw")
        );
    }

    #[test]
    fn test_output_format() {
        assert_eq!(output_format(Path::new("a.PNG")).unwrap(), TileFormat::Png);
        assert_eq!(output_format(Path::new("a.jpeg")).unwrap(), TileFormat::Jpeg);
        assert!(output_format(Path::new("a.tif")).is_err());
        assert!(output_format(Path::new("a")).is_err());
    }

    #[test]
    fn test_service_config_from_settings() {
        let settings = Settings {
            cache_dir: PathBuf::from("cache"),
            catalog: None,
            engine: EngineKind::Builtin,
            timeout: 9,
            max_age: 30,
        };
        let config = settings.service_config();
        assert_eq!(config.projection.engine, EngineKind::Builtin);
        assert_eq!(config.download_timeout_secs, 9);
        assert_eq!(config.max_age_days, 30);
        assert_eq!(config.nb_threads, 10);
    }
}
