//! Tile orchestration over one source.
//!
//! A [`MapService`] serves the tiles of a source either in the grid the
//! server uses or in a destination grid. Destination tiles are built by
//! assembling and warping source tiles, which goes through the same batch
//! machinery recursively.
//!
//! Batches run on a pool of tokio tasks pulling from a shared queue; results
//! flow back to a single aggregator over a channel. Progress-tracked batches
//! (the public entry points) are serialized by an async mutex, so a batch
//! started after [`MapService::stop`] waits for the workers of the previous
//! one to be joined.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use map_common::{BoundingBox, Crs, MapError, MapResult, TileAddress};
use projection::mercator::{degrees_to_meters, meters_to_degrees};
use projection::ReprojEngine;
use image::Rgba;
use raster::{GeoImage, WarpTarget, BACKGROUND, CORRUPT_TILE, EMPTY_TILE, TRANSPARENT};
use rayon::prelude::*;
use serde::Serialize;
use storage::{GeoPackage, MatrixSet};
use tile_grid::{BBoxRequest, MultiZoomRequest, NearestRule, TileMatrix, Units};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Catalog, LayerDefinition, ServiceConfig, SourceDefinition};
use crate::fetch::{HttpFetcher, TileFetcher};
use crate::progress::{Progress, ProgressSnapshot, Status};
use crate::url;

/// Tiles written to the cache per transaction while seeding.
pub const SEED_BUFFER_SIZE: usize = 5000;

/// Workers used to gather the source tiles of one destination tile.
const DST_TILE_THREADS: usize = 4;

/// Options of [`MapService::get_image`].
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    /// Work in the destination grid instead of the source grid.
    pub to_dst_grid: bool,
    pub use_cache: bool,
    pub nb_threads: usize,
    /// Reproject the mosaic into this CRS.
    pub out_crs: Option<Crs>,
    /// Fill missing tiles instead of discarding the whole image.
    pub allow_empty_tile: bool,
}

impl Default for ImageRequest {
    fn default() -> Self {
        Self {
            to_dst_grid: false,
            use_cache: true,
            nb_threads: 10,
            out_crs: None,
            allow_empty_tile: true,
        }
    }
}

/// Outcome of [`MapService::seed_cache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub requested: usize,
    /// Tiles already cached and left untouched.
    pub cached: usize,
    pub downloaded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
struct BatchMode {
    to_dst_grid: bool,
    read_cache: bool,
    write_cache: bool,
    nb_threads: usize,
    tracked: bool,
}

impl BatchMode {
    fn uses_cache(&self) -> bool {
        self.read_cache || self.write_cache
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MosaicStats {
    pasted: usize,
    missing: usize,
    corrupt: usize,
    /// Tiles of the extent lying beyond the grid bounds.
    outside: usize,
}

impl MosaicStats {
    /// Every tile the grid defines over the extent was pasted.
    fn has_grid_tiles(&self) -> bool {
        self.missing == 0 && self.corrupt == 0
    }

    fn is_complete(&self) -> bool {
        self.has_grid_tiles() && self.outside == 0
    }
}

struct Inner {
    source_key: String,
    source: SourceDefinition,
    src_grid_key: String,
    src_tm: TileMatrix,
    dst: Option<(String, TileMatrix)>,
    cache_folder: PathBuf,
    caches: Mutex<HashMap<String, GeoPackage>>,
    config: ServiceConfig,
    engine: Arc<ReprojEngine>,
    fetcher: Arc<dyn TileFetcher>,
    progress: Progress,
    batch: Mutex<()>,
}

/// Cached access to the tiles of one source. Cloning is cheap and clones
/// share caches, progress and the running flag.
#[derive(Clone)]
pub struct MapService {
    inner: Arc<Inner>,
}

impl fmt::Debug for MapService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapService")
            .field("source", &self.inner.source_key)
            .field("src_grid", &self.inner.src_grid_key)
            .field("dst_grid", &self.dst_grid_key())
            .field("cache_folder", &self.inner.cache_folder)
            .finish()
    }
}

/// Configures a [`MapService`] before its grids are built.
pub struct MapServiceBuilder {
    source_key: String,
    cache_folder: PathBuf,
    dst_grid_key: Option<String>,
    catalog: Option<Catalog>,
    config: ServiceConfig,
    fetcher: Option<Arc<dyn TileFetcher>>,
    engine: Option<Arc<ReprojEngine>>,
}

impl MapServiceBuilder {
    /// Use `catalog` instead of the built-in one.
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn dst_grid(mut self, key: impl Into<String>) -> Self {
        self.dst_grid_key = Some(key.into());
        self
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn TileFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Share a reprojection engine with other services.
    pub fn engine(mut self, engine: Arc<ReprojEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub async fn build(self) -> MapResult<MapService> {
        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => Catalog::builtin()?,
        };
        let source = catalog.source(&self.source_key)?.clone();
        let engine = match self.engine {
            Some(engine) => engine,
            None => Arc::new(ReprojEngine::new(self.config.projection.clone())?),
        };

        let src_tm = TileMatrix::from_definition(catalog.grid(&source.grid)?, &engine).await?;
        let dst = match self.dst_grid_key {
            Some(key) if key != source.grid => {
                let tm = TileMatrix::from_definition(catalog.grid(&key)?, &engine).await?;
                Some((key, tm))
            }
            _ => None,
        };

        let fetcher: Arc<dyn TileFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(&self.config)?),
        };

        info!(
            source = %self.source_key,
            service = %source.service,
            src_grid = %source.grid,
            dst_grid = ?dst.as_ref().map(|(key, _)| key.as_str()),
            cache_folder = %self.cache_folder.display(),
            "Map service ready"
        );

        Ok(MapService {
            inner: Arc::new(Inner {
                source_key: self.source_key,
                src_grid_key: source.grid.clone(),
                source,
                src_tm,
                dst,
                cache_folder: self.cache_folder,
                caches: Mutex::new(HashMap::new()),
                config: self.config,
                engine,
                fetcher,
                progress: Progress::default(),
                batch: Mutex::new(()),
            }),
        })
    }
}

impl MapService {
    /// Service over a built-in source, caching under `cache_folder`.
    ///
    /// A destination grid equal to the source grid is ignored.
    pub async fn new(
        source_key: &str,
        cache_folder: impl AsRef<Path>,
        dst_grid_key: Option<&str>,
    ) -> MapResult<Self> {
        let mut builder = Self::builder(source_key, cache_folder);
        if let Some(key) = dst_grid_key {
            builder = builder.dst_grid(key);
        }
        builder.build().await
    }

    pub fn builder(source_key: &str, cache_folder: impl AsRef<Path>) -> MapServiceBuilder {
        MapServiceBuilder {
            source_key: source_key.to_string(),
            cache_folder: cache_folder.as_ref().to_path_buf(),
            dst_grid_key: None,
            catalog: None,
            config: ServiceConfig::default(),
            fetcher: None,
            engine: None,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn source_key(&self) -> &str {
        &self.inner.source_key
    }

    pub fn source(&self) -> &SourceDefinition {
        &self.inner.source
    }

    pub fn layer(&self, key: &str) -> MapResult<&LayerDefinition> {
        self.inner.source.layer(key)
    }

    pub fn src_grid_key(&self) -> &str {
        &self.inner.src_grid_key
    }

    pub fn dst_grid_key(&self) -> Option<&str> {
        self.inner.dst.as_ref().map(|(key, _)| key.as_str())
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &Arc<ReprojEngine> {
        &self.inner.engine
    }

    /// Source grid, or the destination grid when `dst_grid` is set.
    pub fn get_tm(&self, dst_grid: bool) -> MapResult<&TileMatrix> {
        if !dst_grid {
            return Ok(&self.inner.src_tm);
        }
        self.inner
            .dst
            .as_ref()
            .map(|(_, tm)| tm)
            .ok_or_else(no_dst_grid)
    }

    fn grid_key(&self, dst_grid: bool) -> MapResult<&str> {
        if dst_grid {
            self.dst_grid_key().ok_or_else(no_dst_grid)
        } else {
            Ok(&self.inner.src_grid_key)
        }
    }

    pub fn bbox_request(
        &self,
        bbox: &BoundingBox,
        zoom: u32,
        dst_grid: bool,
    ) -> MapResult<BBoxRequest> {
        Ok(BBoxRequest::new(self.get_tm(dst_grid)?, bbox, zoom))
    }

    pub fn is_tile_in_maps_bounds(&self, col: i64, row: i64, zoom: u32, dst_grid: bool) -> bool {
        self.get_tm(dst_grid)
            .map(|tm| tm.is_tile_in_bounds(col, row, zoom))
            .unwrap_or(false)
    }

    // ========================================================================
    // Progress
    // ========================================================================

    pub fn start(&self) {
        self.inner.progress.start();
    }

    /// Abort running batches. In-flight downloads are dropped and the
    /// current call returns early; call [`MapService::start`] to resume.
    pub fn stop(&self) {
        info!(source = %self.inner.source_key, "Stopping map service");
        self.inner.progress.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.progress.is_running()
    }

    pub fn status(&self) -> Status {
        self.inner.progress.status()
    }

    pub fn report(&self) -> String {
        self.inner.progress.snapshot().report()
    }

    pub fn completed_count(&self) -> usize {
        self.inner.progress.completed()
    }

    pub fn total_count(&self) -> usize {
        self.inner.progress.total()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.inner.progress.snapshot()
    }

    // ========================================================================
    // Caches and downloads
    // ========================================================================

    /// Cache of `layer` in the source or destination grid, opened on first use.
    pub async fn get_cache(&self, layer: &str, dst_grid: bool) -> MapResult<GeoPackage> {
        self.layer(layer)?;
        let grid_key = self.grid_key(dst_grid)?;
        let key = format!("{}_{}_{}", self.inner.source_key, layer, grid_key);

        let mut caches = self.inner.caches.lock().await;
        if let Some(cache) = caches.get(&key) {
            return Ok(cache.clone());
        }

        let matrix = MatrixSet::try_from(self.get_tm(dst_grid)?)?;
        let path = self.inner.cache_folder.join(format!("{}.gpkg", key));
        let cache = GeoPackage::open(&path, &matrix)
            .await?
            .with_max_age(chrono::Duration::days(self.inner.config.max_age_days));
        caches.insert(key, cache.clone());
        Ok(cache)
    }

    /// Request URL of a tile of the source grid.
    pub fn build_url(&self, layer: &str, col: i64, row: i64, zoom: u32) -> MapResult<String> {
        url::build_url(
            &self.inner.source,
            self.layer(layer)?,
            &self.inner.src_tm,
            &TileAddress::new(col, row, zoom),
        )
    }

    /// Download a tile of the source grid; failures are logged and give `None`.
    pub async fn download_tile(&self, layer: &str, col: i64, row: i64, zoom: u32) -> Option<Bytes> {
        let url = match self.build_url(layer, col, row, zoom) {
            Ok(url) => url,
            Err(e) => {
                warn!(col, row, zoom, error = %e, "Can't build tile url");
                return None;
            }
        };
        debug!(url = %url, "Downloading tile");

        let token = self.inner.progress.token();
        let result = tokio::select! {
            _ = token.cancelled() => {
                debug!(col, row, zoom, "Download cancelled");
                return None;
            }
            result = self.inner.fetcher.fetch(&url, &self.inner.source.referer) => result,
        };

        match result {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(col, row, zoom, url = %url, error = %e, "Can't download tile");
                None
            }
        }
    }

    /// Tile bytes without touching the cache of `tile` itself.
    ///
    /// Tiles outside the grid give `None`. Destination tiles are built from
    /// source tiles, which may use the source cache when `use_cache` is set.
    fn tile_request<'a>(
        &'a self,
        layer: &'a str,
        tile: TileAddress,
        to_dst_grid: bool,
        use_cache: bool,
    ) -> BoxFuture<'a, Option<Bytes>> {
        async move {
            let in_bounds = self
                .get_tm(to_dst_grid)
                .map(|tm| tm.is_address_in_bounds(&tile))
                .unwrap_or(false);
            if !in_bounds {
                debug!(%tile, "Tile outside the grid");
                return None;
            }

            if to_dst_grid {
                self.build_dst_tile(layer, tile, use_cache).await
            } else {
                match self.layer(layer) {
                    Ok(def) if def.has_zoom(tile.zoom) => {
                        self.download_tile(layer, tile.col, tile.row, tile.zoom).await
                    }
                    _ => None,
                }
            }
        }
        .boxed()
    }

    async fn build_dst_tile(&self, layer: &str, tile: TileAddress, use_cache: bool) -> Option<Bytes> {
        match self.try_build_dst_tile(layer, tile, use_cache).await {
            Ok(data) => data,
            Err(e) if e.is_tile_local() => {
                warn!(%tile, error = %e, "Can't build destination tile");
                None
            }
            Err(e) => {
                error!(%tile, error = %e, "Destination tile build failed");
                None
            }
        }
    }

    /// Warp the source tiles under a destination tile into that tile.
    ///
    /// The tile is only produced when every source tile it covers is
    /// available, so incomplete tiles never reach the destination cache.
    /// Parts beyond the source grid stay transparent.
    async fn try_build_dst_tile(
        &self,
        layer: &str,
        tile: TileAddress,
        use_cache: bool,
    ) -> MapResult<Option<Bytes>> {
        let dst = self.get_tm(true)?;
        let src = &self.inner.src_tm;
        let layer_def = self.layer(layer)?;

        let bbox = dst.get_tile_bbox(tile.col, tile.row, tile.zoom);
        let res = dst.get_res(tile.zoom);
        let src_res = match (dst.units(), src.units()) {
            (Units::Degrees, Units::Meters) => degrees_to_meters(res),
            (Units::Meters, Units::Degrees) => meters_to_degrees(res),
            _ => res,
        };
        let src_zoom = layer_def
            .clamp_zoom(src.get_nearest_zoom(src_res, NearestRule::Closer))
            .min(src.max_zoom());

        let to_src = self.inner.engine.get(dst.crs(), src.crs()).await?;
        let src_bbox = to_src.bbox(&bbox).await?;
        if !src_bbox.is_valid() {
            return Err(MapError::Reprojection(format!(
                "tile {} has no extent in {}",
                tile,
                src.crs()
            )));
        }

        let mode = BatchMode {
            to_dst_grid: false,
            read_cache: use_cache,
            write_cache: use_cache,
            nb_threads: DST_TILE_THREADS,
            tracked: false,
        };
        let (mosaic, stats) = match self
            .build_mosaic(layer, &src_bbox, src_zoom, mode, TRANSPARENT)
            .await?
        {
            Some(built) => built,
            None => return Ok(None),
        };
        if !stats.has_grid_tiles() || stats.pasted == 0 {
            debug!(
                %tile,
                missing = stats.missing,
                corrupt = stats.corrupt,
                outside = stats.outside,
                "Source tiles unavailable for destination tile"
            );
            return Ok(None);
        }

        let ts = dst.tile_size();
        let target = WarpTarget::new((bbox.min_x, bbox.max_y), ts, ts, res);
        let warped = raster::reproject(mosaic, &to_src, target, self.inner.config.resampling).await?;
        Ok(Some(Bytes::from(warped.encode(layer_def.tile_format())?)))
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// One tile, from the cache when possible.
    ///
    /// Source tiles outside the layer zoom bounds give `None`.
    #[instrument(skip(self), fields(source = %self.inner.source_key))]
    pub async fn get_tile(
        &self,
        layer: &str,
        col: i64,
        row: i64,
        zoom: u32,
        to_dst_grid: bool,
        use_cache: bool,
    ) -> MapResult<Option<Bytes>> {
        let layer_def = self.layer(layer)?;
        self.get_tm(to_dst_grid)?;
        if !to_dst_grid && !layer_def.has_zoom(zoom) {
            return Ok(None);
        }

        let tile = TileAddress::new(col, row, zoom);
        let cache = if use_cache {
            Some(self.get_cache(layer, to_dst_grid).await?)
        } else {
            None
        };
        if let Some(cache) = &cache {
            if let Some(data) = cache.get_tile(&tile).await? {
                return Ok(Some(data));
            }
        }

        let data = self.tile_request(layer, tile, to_dst_grid, use_cache).await;
        if let (Some(cache), Some(data)) = (&cache, &data) {
            cache.put_tile(&tile, data).await?;
        }
        Ok(data)
    }

    /// Several tiles at once, one result per distinct address.
    ///
    /// Cached tiles are read in bulk; the others are fetched by `nb_threads`
    /// workers and written back in a single transaction.
    #[instrument(skip(self, tiles), fields(source = %self.inner.source_key, count = tiles.len()))]
    pub async fn get_tiles(
        &self,
        layer: &str,
        tiles: &[TileAddress],
        to_dst_grid: bool,
        use_cache: bool,
        nb_threads: usize,
    ) -> MapResult<Vec<(TileAddress, Option<Bytes>)>> {
        self.layer(layer)?;
        self.get_tm(to_dst_grid)?;

        let tiles = unique_tiles(tiles);
        let _batch = self.inner.batch.lock().await;
        self.inner.progress.begin(tiles.len());
        let mode = BatchMode {
            to_dst_grid,
            read_cache: use_cache,
            write_cache: use_cache,
            nb_threads,
            tracked: true,
        };
        let result = self.fetch_tiles(layer, &tiles, mode).await;
        self.inner.progress.finish();
        result
    }

    /// Download into the cache every tile covering `bbox` at each of `zooms`.
    ///
    /// Without `refresh`, tiles already cached (and fresh) are skipped.
    #[instrument(skip(self), fields(source = %self.inner.source_key))]
    pub async fn seed_cache(
        &self,
        layer: &str,
        bbox: &BoundingBox,
        zooms: &[u32],
        to_dst_grid: bool,
        nb_threads: usize,
        refresh: bool,
    ) -> MapResult<SeedSummary> {
        let tiles = self.tiles_in(layer, bbox, zooms, to_dst_grid)?;

        let _batch = self.inner.batch.lock().await;
        let result = self
            .seed_tiles(layer, tiles, to_dst_grid, nb_threads, refresh)
            .await;
        self.inner.progress.finish();
        result
    }

    /// Remove from the cache every tile covering `bbox` at each of `zooms`.
    #[instrument(skip(self), fields(source = %self.inner.source_key))]
    pub async fn purge_cache(
        &self,
        layer: &str,
        bbox: &BoundingBox,
        zooms: &[u32],
        to_dst_grid: bool,
    ) -> MapResult<u64> {
        let tiles = self.tiles_in(layer, bbox, zooms, to_dst_grid)?;
        let cache = self.get_cache(layer, to_dst_grid).await?;
        let deleted = cache.delete_tiles(&tiles).await?;
        info!(layer, requested = tiles.len(), deleted, "Cache purged");
        Ok(deleted)
    }

    /// Mosaic of the tiles covering `bbox` at `zoom`.
    ///
    /// Returns `None` when the service is stopped meanwhile, or when a tile
    /// is missing and `allow_empty_tile` is off.
    #[instrument(skip(self, opts), fields(source = %self.inner.source_key))]
    pub async fn get_image(
        &self,
        layer: &str,
        bbox: &BoundingBox,
        zoom: u32,
        opts: &ImageRequest,
    ) -> MapResult<Option<GeoImage>> {
        let layer_def = self.layer(layer)?;
        let tm = self.get_tm(opts.to_dst_grid)?;
        check_extent(bbox)?;
        let zoom = if opts.to_dst_grid {
            zoom.min(tm.max_zoom())
        } else {
            layer_def.clamp_zoom(zoom).min(tm.max_zoom())
        };

        let _batch = self.inner.batch.lock().await;
        let result = self.image_batch(layer, tm, bbox, zoom, opts).await;
        self.inner.progress.finish();
        result
    }

    fn tiles_in(
        &self,
        layer: &str,
        bbox: &BoundingBox,
        zooms: &[u32],
        to_dst_grid: bool,
    ) -> MapResult<Vec<TileAddress>> {
        let layer_def = self.layer(layer)?;
        let tm = self.get_tm(to_dst_grid)?;
        check_extent(bbox)?;

        let zooms: Vec<u32> = zooms
            .iter()
            .map(|&z| {
                let z = z.min(tm.max_zoom());
                if to_dst_grid {
                    z
                } else {
                    layer_def.clamp_zoom(z)
                }
            })
            .collect();
        let request = MultiZoomRequest::new(tm, bbox, &zooms);
        Ok(request
            .tiles()
            .into_iter()
            .filter(|tile| tm.is_address_in_bounds(tile))
            .collect())
    }

    async fn seed_tiles(
        &self,
        layer: &str,
        tiles: Vec<TileAddress>,
        to_dst_grid: bool,
        nb_threads: usize,
        refresh: bool,
    ) -> MapResult<SeedSummary> {
        let progress = &self.inner.progress;
        let start = Instant::now();
        progress.begin(tiles.len());
        progress.set_status(Status::GetCache);

        let cache = self.get_cache(layer, to_dst_grid).await?;
        let todo: Vec<TileAddress> = if refresh {
            tiles.clone()
        } else {
            let missing = cache.list_missing_tiles(&tiles).await?;
            tiles.iter().copied().filter(|t| missing.contains(t)).collect()
        };

        let mut summary = SeedSummary {
            requested: tiles.len(),
            cached: tiles.len() - todo.len(),
            ..Default::default()
        };
        progress.advance(summary.cached);
        progress.set_status(Status::Downloading);
        info!(
            layer,
            requested = summary.requested,
            cached = summary.cached,
            "Seeding cache"
        );

        let mode = BatchMode {
            to_dst_grid,
            read_cache: false,
            write_cache: true,
            nb_threads,
            tracked: true,
        };
        for chunk in todo.chunks(SEED_BUFFER_SIZE) {
            if !self.is_running() {
                break;
            }
            let results = self.fetch_tiles(layer, chunk, mode).await?;
            summary.downloaded += results.iter().filter(|(_, data)| data.is_some()).count();
        }
        summary.failed = summary.requested - summary.cached - summary.downloaded;

        info!(
            layer,
            downloaded = summary.downloaded,
            failed = summary.failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Seeding finished"
        );
        Ok(summary)
    }

    async fn image_batch(
        &self,
        layer: &str,
        tm: &TileMatrix,
        bbox: &BoundingBox,
        zoom: u32,
        opts: &ImageRequest,
    ) -> MapResult<Option<GeoImage>> {
        let start = Instant::now();
        let mode = BatchMode {
            to_dst_grid: opts.to_dst_grid,
            read_cache: opts.use_cache,
            write_cache: opts.use_cache,
            nb_threads: opts.nb_threads,
            tracked: true,
        };
        let (mosaic, stats) = match self.build_mosaic(layer, bbox, zoom, mode, EMPTY_TILE).await? {
            Some(built) => built,
            None => return Ok(None),
        };
        if !opts.allow_empty_tile && !stats.is_complete() {
            info!(
                missing = stats.missing,
                corrupt = stats.corrupt,
                outside = stats.outside,
                "Incomplete mosaic discarded"
            );
            return Ok(None);
        }

        let mosaic = match &opts.out_crs {
            Some(out_crs) if out_crs != tm.crs() => {
                self.inner.progress.set_status(Status::Reprojecting);
                let forward = self.inner.engine.get(tm.crs(), out_crs).await?;
                let inverse = self.inner.engine.get(out_crs, tm.crs()).await?;
                let warped =
                    raster::reproject_to(mosaic, &forward, &inverse, self.inner.config.resampling)
                        .await?;
                if !self.is_running() {
                    return Ok(None);
                }
                warped
            }
            _ => mosaic,
        };

        info!(
            layer,
            zoom,
            width = mosaic.width(),
            height = mosaic.height(),
            missing = stats.missing,
            corrupt = stats.corrupt,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Image built"
        );
        Ok(Some(mosaic))
    }

    /// Cache lookup plus download of `tiles`, one result per distinct address
    /// in request order.
    async fn fetch_tiles(
        &self,
        layer: &str,
        tiles: &[TileAddress],
        mode: BatchMode,
    ) -> MapResult<Vec<(TileAddress, Option<Bytes>)>> {
        let progress = &self.inner.progress;
        let unique = unique_tiles(tiles);

        let cache = if mode.uses_cache() {
            if mode.tracked && mode.read_cache {
                progress.set_status(Status::GetCache);
            }
            Some(self.get_cache(layer, mode.to_dst_grid).await?)
        } else {
            None
        };

        let mut found: HashMap<TileAddress, Option<Bytes>> = HashMap::with_capacity(unique.len());
        if let (Some(cache), true) = (&cache, mode.read_cache) {
            for record in cache.get_tiles(&unique).await? {
                found.insert(record.address, Some(record.data));
            }
        }
        let missing: Vec<TileAddress> = unique
            .iter()
            .copied()
            .filter(|t| !found.contains_key(t))
            .collect();
        if mode.tracked {
            progress.advance(found.len());
            progress.set_status(Status::Downloading);
        }

        let downloaded = self.download_all(layer, missing, mode).await;
        if let (Some(cache), true) = (&cache, mode.write_cache) {
            let fresh: Vec<(TileAddress, Bytes)> = downloaded
                .iter()
                .filter_map(|(tile, data)| data.clone().map(|data| (*tile, data)))
                .collect();
            if !fresh.is_empty() {
                cache.put_tiles(&fresh).await?;
            }
        }
        found.extend(downloaded);

        Ok(unique
            .into_iter()
            .map(|tile| {
                let data = found.remove(&tile).flatten();
                (tile, data)
            })
            .collect())
    }

    /// Run `tiles` through a pool of workers. Tiles left in the queue when
    /// the service stops are absent from the result.
    async fn download_all(
        &self,
        layer: &str,
        tiles: Vec<TileAddress>,
        mode: BatchMode,
    ) -> HashMap<TileAddress, Option<Bytes>> {
        let mut results = HashMap::with_capacity(tiles.len());
        if tiles.is_empty() {
            return results;
        }

        let start = Instant::now();
        let requested = tiles.len();
        let nb_workers = mode.nb_threads.clamp(1, requested);
        let queue = Arc::new(std::sync::Mutex::new(VecDeque::from(tiles)));
        let (tx, mut rx) = mpsc::channel(nb_workers * 4);

        let workers: Vec<_> = (0..nb_workers)
            .map(|_| {
                let service = self.clone();
                let queue = queue.clone();
                let tx = tx.clone();
                let layer = layer.to_string();
                tokio::spawn(async move {
                    while service.is_running() {
                        let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                        let Some(tile) = next else { break };
                        let data = service
                            .tile_request(&layer, tile, mode.to_dst_grid, mode.uses_cache())
                            .await;
                        if mode.tracked {
                            service.inner.progress.advance(1);
                        }
                        if tx.send((tile, data)).await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        drop(tx);

        while let Some((tile, data)) = rx.recv().await {
            results.insert(tile, data);
        }
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Tile worker failed");
            }
        }

        debug!(
            requested,
            received = results.len(),
            succeeded = results.values().filter(|d| d.is_some()).count(),
            workers = nb_workers,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Tile batch finished"
        );
        results
    }

    /// Fetch and paste the tiles covering `bbox`. Out-of-grid tiles are
    /// never requested; their area is filled with `outside_fill`.
    async fn build_mosaic(
        &self,
        layer: &str,
        bbox: &BoundingBox,
        zoom: u32,
        mode: BatchMode,
        outside_fill: Rgba<u8>,
    ) -> MapResult<Option<(GeoImage, MosaicStats)>> {
        let tm = self.get_tm(mode.to_dst_grid)?;
        let request = BBoxRequest::new(tm, bbox, zoom);
        if request.nb_tiles() == 0 {
            return Err(MapError::Configuration(format!(
                "extent {:?} covers no tile at zoom {}",
                bbox, zoom
            )));
        }
        request.mosaic_size()?;

        let (inside, outside): (Vec<_>, Vec<_>) = request
            .tiles()
            .into_iter()
            .partition(|tile| tm.is_address_in_bounds(tile));
        if mode.tracked {
            self.inner.progress.begin(inside.len());
        }
        let tiles = self.fetch_tiles(layer, &inside, mode).await?;

        if !self.is_running() {
            return Ok(None);
        }
        if mode.tracked {
            self.inner.progress.set_status(Status::BuildingMosaic);
        }

        let service = self.clone();
        tokio::task::spawn_blocking(move || {
            service.paste_tiles(&request, tiles, &outside, outside_fill)
        })
        .await
        .map_err(|e| MapError::Image(format!("mosaic task failed: {}", e)))?
    }

    fn paste_tiles(
        &self,
        request: &BBoxRequest,
        tiles: Vec<(TileAddress, Option<Bytes>)>,
        outside: &[TileAddress],
        outside_fill: Rgba<u8>,
    ) -> MapResult<Option<(GeoImage, MosaicStats)>> {
        let (width, height) = request.mosaic_size()?;
        let ts = request.tile_size();
        let mut mosaic = GeoImage::filled(
            width,
            height,
            BACKGROUND,
            request.mosaic_origin(),
            request.res(),
        )?;

        let decoded: Vec<_> = tiles
            .into_par_iter()
            .map(|(tile, data)| (tile, data.map(|data| raster::decode(&data))))
            .collect();

        let mut stats = MosaicStats {
            outside: outside.len(),
            ..Default::default()
        };
        for tile in outside {
            let (x, y) = request.pixel_offset(tile.col, tile.row);
            mosaic.fill_rect(x, y, ts, ts, outside_fill);
        }
        for (tile, data) in decoded {
            if !self.is_running() {
                return Ok(None);
            }
            let (x, y) = request.pixel_offset(tile.col, tile.row);
            match data {
                Some(Ok(img)) => {
                    stats.pasted += 1;
                    mosaic.paste(&img, x, y);
                }
                Some(Err(e)) => {
                    debug!(%tile, error = %e, "Undecodable tile");
                    stats.corrupt += 1;
                    mosaic.fill_rect(x, y, ts, ts, CORRUPT_TILE);
                }
                None => {
                    stats.missing += 1;
                    mosaic.fill_rect(x, y, ts, ts, EMPTY_TILE);
                }
            }
        }
        Ok(Some((mosaic, stats)))
    }
}

/// Tiles in first-seen order, without repeats.
fn unique_tiles(tiles: &[TileAddress]) -> Vec<TileAddress> {
    let mut seen = HashSet::with_capacity(tiles.len());
    tiles.iter().copied().filter(|t| seen.insert(*t)).collect()
}

fn no_dst_grid() -> MapError {
    MapError::Configuration("no destination grid defined".to_string())
}

fn check_extent(bbox: &BoundingBox) -> MapResult<()> {
    if bbox.is_valid() {
        Ok(())
    } else {
        Err(MapError::Configuration(format!("invalid extent {:?}", bbox)))
    }
}
