//! Tile index arithmetic over a validated grid.

use map_common::{BoundingBox, Crs, MapError, MapResult, TileAddress};
use projection::ReprojEngine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::definition::{GridDefinition, TileOrigin};
use crate::request::BBoxRequest;

/// How [`TileMatrix::get_nearest_zoom`] picks between two bracketing levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NearestRule {
    /// The level with the nearest resolution; ties go to the finer level.
    #[default]
    Closer,
    /// The coarser level (larger resolution).
    Lower,
    /// The finer level (smaller resolution).
    Higher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    Degrees,
    Meters,
}

#[derive(Debug, Clone, PartialEq)]
enum Pyramid {
    Explicit(Vec<f64>),
    Progression {
        init_res: f64,
        factor: f64,
        nb_levels: u32,
    },
}

/// Validated tiling scheme with its bbox in the grid CRS.
#[derive(Debug, Clone, PartialEq)]
pub struct TileMatrix {
    name: String,
    crs: Crs,
    bbox: BoundingBox,
    tile_size: u32,
    origin: TileOrigin,
    pyramid: Pyramid,
    units: Units,
}

impl TileMatrix {
    /// Build from a definition whose bbox is expressed in the grid CRS.
    ///
    /// Definitions with a bbox in another CRS need
    /// [`TileMatrix::from_definition`].
    pub fn new(def: &GridDefinition) -> MapResult<Self> {
        if def.bbox_crs != def.crs {
            return Err(MapError::Configuration(format!(
                "grid '{}' has its bbox in {} and must be built with a reprojection engine",
                def.name, def.bbox_crs
            )));
        }
        Self::with_extent(def, def.bbox())
    }

    /// Build from any definition, reprojecting the bbox into the grid CRS.
    pub async fn from_definition(def: &GridDefinition, engine: &ReprojEngine) -> MapResult<Self> {
        def.validate()?;
        let bbox = if def.bbox_crs == def.crs {
            def.bbox()
        } else {
            let reproj = engine.get(&def.bbox_crs, &def.crs).await?;
            reproj.bbox(&def.bbox()).await?
        };
        Self::with_extent(def, bbox)
    }

    /// Build from a definition and its bbox already reprojected.
    pub fn with_extent(def: &GridDefinition, bbox: BoundingBox) -> MapResult<Self> {
        def.validate()?;

        let pyramid = match &def.resolutions {
            Some(resolutions) => Pyramid::Explicit(resolutions.clone()),
            None => {
                // Level 0 fits the whole extent in one tile
                let init_res = def
                    .init_res
                    .unwrap_or_else(|| bbox.width().max(bbox.height()) / def.tile_size as f64);
                Pyramid::Progression {
                    init_res,
                    factor: def.res_factor,
                    nb_levels: def.nb_levels,
                }
            }
        };

        let units = if def.crs.is_geographic() {
            Units::Degrees
        } else {
            Units::Meters
        };

        debug!(grid = %def.name, crs = %def.crs, ?bbox, "Tile matrix built");

        Ok(Self {
            name: def.name.clone(),
            crs: def.crs.clone(),
            bbox,
            tile_size: def.tile_size,
            origin: def.origin,
            pyramid,
            units,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn crs(&self) -> &Crs {
        &self.crs
    }

    /// Grid extent in the grid CRS.
    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn origin(&self) -> TileOrigin {
        self.origin
    }

    pub fn units(&self) -> Units {
        self.units
    }

    /// Coordinate of the grid corner holding tile (0, 0).
    pub fn origin_coords(&self) -> (f64, f64) {
        match self.origin {
            TileOrigin::NorthWest => (self.bbox.min_x, self.bbox.max_y),
            TileOrigin::SouthWest => (self.bbox.min_x, self.bbox.min_y),
        }
    }

    pub fn nb_levels(&self) -> u32 {
        match &self.pyramid {
            Pyramid::Explicit(resolutions) => resolutions.len() as u32,
            Pyramid::Progression { nb_levels, .. } => *nb_levels,
        }
    }

    pub fn max_zoom(&self) -> u32 {
        self.nb_levels() - 1
    }

    /// Ground size of one pixel at `zoom`, in grid units.
    ///
    /// An explicit list is clamped at its last level; a progression keeps
    /// dividing past `nb_levels`.
    pub fn get_res(&self, zoom: u32) -> f64 {
        match &self.pyramid {
            Pyramid::Explicit(resolutions) => {
                let idx = (zoom as usize).min(resolutions.len() - 1);
                resolutions[idx]
            }
            Pyramid::Progression {
                init_res, factor, ..
            } => init_res / factor.powi(zoom as i32),
        }
    }

    pub fn get_res_list(&self) -> Vec<f64> {
        (0..self.nb_levels()).map(|z| self.get_res(z)).collect()
    }

    fn tile_span(&self, zoom: u32) -> f64 {
        self.tile_size as f64 * self.get_res(zoom)
    }

    /// Tile containing the point `(x, y)`.
    pub fn get_tile_number(&self, x: f64, y: f64, zoom: u32) -> (i64, i64) {
        let span = self.tile_span(zoom);
        let (ox, oy) = self.origin_coords();
        let dy = match self.origin {
            TileOrigin::NorthWest => oy - y,
            TileOrigin::SouthWest => y - oy,
        };
        (((x - ox) / span).floor() as i64, (dy / span).floor() as i64)
    }

    /// Upper-left corner of a tile, whatever the grid origin.
    pub fn get_tile_coords(&self, col: i64, row: i64, zoom: u32) -> (f64, f64) {
        let span = self.tile_span(zoom);
        let (ox, oy) = self.origin_coords();
        let x = ox + col as f64 * span;
        let y = match self.origin {
            TileOrigin::NorthWest => oy - row as f64 * span,
            TileOrigin::SouthWest => oy + (row + 1) as f64 * span,
        };
        (x, y)
    }

    pub fn get_tile_bbox(&self, col: i64, row: i64, zoom: u32) -> BoundingBox {
        let span = self.tile_span(zoom);
        let (xmin, ymax) = self.get_tile_coords(col, row, zoom);
        BoundingBox::new(xmin, ymax - span, xmin + span, ymax)
    }

    pub fn get_tile_center(&self, col: i64, row: i64, zoom: u32) -> (f64, f64) {
        self.get_tile_bbox(col, row, zoom).center()
    }

    /// Level whose resolution best matches `res` under `rule`.
    ///
    /// Targets coarser than level 0 map to level 0, targets finer than the
    /// last level map to the last level.
    pub fn get_nearest_zoom(&self, res: f64, rule: NearestRule) -> u32 {
        let resolutions = self.get_res_list();
        let last = resolutions.len() - 1;
        if res >= resolutions[0] {
            return 0;
        }
        if res <= resolutions[last] {
            return last as u32;
        }

        for (z1, pair) in resolutions.windows(2).enumerate() {
            let (r1, r2) = (pair[0], pair[1]);
            if res == r2 {
                return (z1 + 1) as u32;
            }
            if r1 > res && res > r2 {
                let z2 = z1 + 1;
                let picked = match rule {
                    NearestRule::Lower => z1,
                    NearestRule::Higher => z2,
                    NearestRule::Closer if r1 - res < res - r2 => z1,
                    NearestRule::Closer => z2,
                };
                return picked as u32;
            }
        }
        last as u32
    }

    /// Ratio `res(to) / res(from)`; 1.0 when either level lies outside the
    /// pyramid.
    pub fn get_from_to_res_fac(&self, from: u32, to: u32) -> f64 {
        if from == to || from > self.max_zoom() || to > self.max_zoom() {
            return 1.0;
        }
        self.get_res(to) / self.get_res(from)
    }

    pub fn get_prev_res_fac(&self, zoom: u32) -> f64 {
        match zoom.checked_sub(1) {
            Some(prev) => self.get_from_to_res_fac(zoom, prev),
            None => 1.0,
        }
    }

    pub fn get_next_res_fac(&self, zoom: u32) -> f64 {
        self.get_from_to_res_fac(zoom, zoom + 1)
    }

    /// Whether the tile lies inside the grid extent. Tiles outside are never
    /// requested from the source.
    pub fn is_tile_in_bounds(&self, col: i64, row: i64, zoom: u32) -> bool {
        if col < 0 || row < 0 {
            return false;
        }
        let (x, y) = self.get_tile_coords(col, row, zoom);
        let b = &self.bbox;
        b.min_x <= x && x < b.max_x && b.min_y < y && y <= b.max_y
    }

    pub fn is_address_in_bounds(&self, tile: &TileAddress) -> bool {
        self.is_tile_in_bounds(tile.col, tile.row, tile.zoom)
    }

    /// Number of columns and rows needed to cover the extent at `zoom`.
    pub fn matrix_size(&self, zoom: u32) -> (u64, u64) {
        let span = self.tile_span(zoom);
        (
            (self.bbox.width() / span).ceil() as u64,
            (self.bbox.height() / span).ceil() as u64,
        )
    }

    pub fn bbox_request(&self, bbox: &BoundingBox, zoom: u32) -> BBoxRequest {
        BBoxRequest::new(self, bbox, zoom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::{assert_approx_eq, assert_bbox_approx_eq};

    /// 4 levels of 100, 50, 25, 12.5 units per pixel over a 1024 x 512 area.
    fn grid(origin: TileOrigin) -> TileMatrix {
        let def = GridDefinition::new(
            "test",
            Crs::epsg(2154),
            BoundingBox::new(0.0, 0.0, 25600.0 * 4.0, 25600.0 * 2.0),
        )
        .with_origin(origin)
        .with_progression(100.0, 2.0, 4);
        TileMatrix::new(&def).unwrap()
    }

    // ============================================================================
    // Resolutions
    // ============================================================================

    #[test]
    fn test_res_list_from_progression() {
        assert_eq!(grid(TileOrigin::NorthWest).get_res_list(), vec![100.0, 50.0, 25.0, 12.5]);
    }

    #[test]
    fn test_default_init_res_fits_extent_in_one_tile() {
        let def = GridDefinition::new("g", Crs::wgs84(), BoundingBox::new(-180.0, -90.0, 180.0, 90.0));
        let tm = TileMatrix::new(&def).unwrap();
        assert_approx_eq!(tm.get_res(0), 360.0 / 256.0, 1e-12);
        assert_eq!(tm.nb_levels(), 24);
        assert_eq!(tm.units(), Units::Degrees);
    }

    #[test]
    fn test_explicit_resolutions_clamped() {
        let def = GridDefinition::new("g", Crs::epsg(2154), BoundingBox::new(0.0, 0.0, 1e5, 1e5))
            .with_resolutions(vec![4000.0, 2000.0, 1000.0]);
        let tm = TileMatrix::new(&def).unwrap();
        assert_eq!(tm.nb_levels(), 3);
        assert_eq!(tm.get_res(2), 1000.0);
        assert_eq!(tm.get_res(10), 1000.0);
        assert_eq!(tm.units(), Units::Meters);
    }

    #[test]
    fn test_bbox_in_foreign_crs_requires_engine() {
        let mut def = GridDefinition::new("g", Crs::web_mercator(), BoundingBox::new(-1.0, -1.0, 1.0, 1.0));
        def.bbox_crs = Crs::wgs84();
        assert!(TileMatrix::new(&def).is_err());
    }

    // ============================================================================
    // Tile numbers and coordinates
    // ============================================================================

    #[test]
    fn test_tile_number_north_west() {
        let def = GridDefinition::new("g", Crs::epsg(2154), BoundingBox::new(0.0, 0.0, 2048.0, 2048.0))
            .with_progression(1.0, 2.0, 4);
        let tm = TileMatrix::new(&def).unwrap();
        let (ox, oy) = tm.origin_coords();
        assert_eq!(tm.get_tile_number(ox + 300.0, oy - 10.0, 0), (1, 0));
    }

    #[test]
    fn test_tile_coords_is_top_left_of_containing_tile() {
        for origin in [TileOrigin::NorthWest, TileOrigin::SouthWest] {
            let tm = grid(origin);
            for &(x, y) in &[(1.0, 1.0), (30000.0, 40000.0), (102399.0, 51199.0), (25600.0, 25600.0)] {
                for zoom in 0..4 {
                    let (col, row) = tm.get_tile_number(x, y, zoom);
                    let tile = tm.get_tile_bbox(col, row, zoom);
                    assert_eq!((tile.min_x, tile.max_y), tm.get_tile_coords(col, row, zoom));
                    assert!(tile.min_x <= x && x < tile.max_x, "{:?} {} {:?}", origin, zoom, tile);
                    assert!(tile.min_y <= y && y <= tile.max_y, "{:?} {} {:?}", origin, zoom, tile);
                }
            }
        }
    }

    #[test]
    fn test_south_west_rows_grow_north() {
        let tm = grid(TileOrigin::SouthWest);
        assert_eq!(tm.get_tile_number(10.0, 10.0, 0), (0, 0));
        assert_eq!(tm.get_tile_number(10.0, 30000.0, 0), (0, 1));
        assert_eq!(tm.get_tile_coords(0, 0, 0), (0.0, 25600.0));
        assert_bbox_approx_eq!(tm.get_tile_bbox(1, 1, 0), (25600.0, 25600.0, 51200.0, 51200.0), 1e-9);
    }

    #[test]
    fn test_tile_center() {
        let tm = grid(TileOrigin::NorthWest);
        assert_eq!(tm.get_tile_center(0, 0, 1), (6400.0, 51200.0 - 6400.0));
    }

    // ============================================================================
    // Nearest zoom
    // ============================================================================

    #[test]
    fn test_nearest_zoom_rules() {
        let tm = grid(TileOrigin::NorthWest);
        assert_eq!(tm.get_nearest_zoom(60.0, NearestRule::Lower), 0);
        assert_eq!(tm.get_nearest_zoom(60.0, NearestRule::Higher), 1);
        assert_eq!(tm.get_nearest_zoom(60.0, NearestRule::Closer), 1);
        assert_eq!(tm.get_nearest_zoom(90.0, NearestRule::Closer), 0);
    }

    #[test]
    fn test_nearest_zoom_equidistant_picks_finer_level() {
        let tm = grid(TileOrigin::NorthWest);
        let zoom = tm.get_nearest_zoom(75.0, NearestRule::Closer);
        assert_eq!(tm.get_res(zoom), 50.0);
    }

    #[test]
    fn test_nearest_zoom_exact_and_out_of_range() {
        let tm = grid(TileOrigin::NorthWest);
        for rule in [NearestRule::Closer, NearestRule::Lower, NearestRule::Higher] {
            assert_eq!(tm.get_nearest_zoom(25.0, rule), 2);
            assert_eq!(tm.get_nearest_zoom(100.0, rule), 0);
            assert_eq!(tm.get_nearest_zoom(1000.0, rule), 0);
            assert_eq!(tm.get_nearest_zoom(1.0, rule), 3);
        }
    }

    #[test]
    fn test_res_factor_clamped_at_pyramid_edges() {
        let tm = grid(TileOrigin::NorthWest);
        assert_eq!(tm.get_from_to_res_fac(0, 1), 0.5);
        assert_eq!(tm.get_from_to_res_fac(3, 1), 4.0);
        assert_eq!(tm.get_from_to_res_fac(3, 4), 1.0);
        assert_eq!(tm.get_next_res_fac(3), 1.0);
        assert_eq!(tm.get_prev_res_fac(0), 1.0);
        assert_eq!(tm.get_prev_res_fac(2), 2.0);
    }

    // ============================================================================
    // Bounds
    // ============================================================================

    #[test]
    fn test_tile_in_bounds() {
        let tm = grid(TileOrigin::NorthWest);
        assert!(tm.is_tile_in_bounds(0, 0, 0));
        assert!(tm.is_tile_in_bounds(3, 1, 0));
        assert!(!tm.is_tile_in_bounds(4, 0, 0));
        assert!(!tm.is_tile_in_bounds(0, 2, 0));
        assert!(!tm.is_tile_in_bounds(-1, 0, 0));
        assert!(tm.is_tile_in_bounds(31, 15, 3));
        assert!(!tm.is_address_in_bounds(&TileAddress::new(32, 0, 3)));
    }

    #[test]
    fn test_matrix_size() {
        let tm = grid(TileOrigin::NorthWest);
        assert_eq!(tm.matrix_size(0), (4, 2));
        assert_eq!(tm.matrix_size(2), (16, 8));
    }
}
