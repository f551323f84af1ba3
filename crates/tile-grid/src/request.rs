//! Tiles covering an extent.

use std::collections::BTreeMap;

use map_common::{BoundingBox, MapError, MapResult, TileAddress};

use crate::definition::TileOrigin;
use crate::matrix::TileMatrix;

/// Largest mosaic assembled in memory, in pixels (1 GiB of RGBA).
pub const MAX_MOSAIC_PIXELS: u64 = 1 << 28;

/// The block of tiles covering a bbox at one zoom level.
///
/// The block starts at the tile holding the upper-left corner of the bbox;
/// its georeferenced extent is snapped to tile boundaries on the left and
/// top sides.
#[derive(Debug, Clone, PartialEq)]
pub struct BBoxRequest {
    zoom: u32,
    tile_size: u32,
    res: f64,
    origin: TileOrigin,
    first_col: i64,
    first_row: i64,
    nb_x: u32,
    nb_y: u32,
    bbox: BoundingBox,
}

impl BBoxRequest {
    pub fn new(tm: &TileMatrix, bbox: &BoundingBox, zoom: u32) -> Self {
        let res = tm.get_res(zoom);
        let span = tm.tile_size() as f64 * res;

        let (first_col, first_row) = tm.get_tile_number(bbox.min_x, bbox.max_y, zoom);
        let (xmin, ymax) = tm.get_tile_coords(first_col, first_row, zoom);
        let snapped = BoundingBox::new(xmin, bbox.min_y, bbox.max_x, ymax);

        let count = |extent: f64| (extent / span).ceil().max(0.0) as u32;

        Self {
            zoom,
            tile_size: tm.tile_size(),
            res,
            origin: tm.origin(),
            first_col,
            first_row,
            nb_x: count(bbox.max_x - xmin),
            nb_y: count(ymax - bbox.min_y),
            bbox: snapped,
        }
    }

    pub fn zoom(&self) -> u32 {
        self.zoom
    }

    pub fn res(&self) -> f64 {
        self.res
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn first_col(&self) -> i64 {
        self.first_col
    }

    pub fn first_row(&self) -> i64 {
        self.first_row
    }

    /// Requested extent with its left and top sides snapped to the grid.
    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn nb_tiles_x(&self) -> u32 {
        self.nb_x
    }

    pub fn nb_tiles_y(&self) -> u32 {
        self.nb_y
    }

    pub fn nb_tiles(&self) -> usize {
        self.nb_x as usize * self.nb_y as usize
    }

    pub fn cols(&self) -> Vec<i64> {
        (0..self.nb_x as i64).map(|i| self.first_col + i).collect()
    }

    /// Rows from north to south.
    pub fn rows(&self) -> Vec<i64> {
        (0..self.nb_y as i64)
            .map(|i| match self.origin {
                TileOrigin::NorthWest => self.first_row + i,
                TileOrigin::SouthWest => self.first_row - i,
            })
            .collect()
    }

    /// Column-major list of the tiles of the block.
    pub fn tiles(&self) -> Vec<TileAddress> {
        let rows = self.rows();
        self.cols()
            .into_iter()
            .flat_map(|col| rows.iter().map(move |&row| TileAddress::new(col, row, self.zoom)))
            .collect()
    }

    /// Pixel size of the mosaic assembled from the block.
    ///
    /// Fails when the mosaic would exceed [`MAX_MOSAIC_PIXELS`].
    pub fn mosaic_size(&self) -> MapResult<(u32, u32)> {
        let width = self.nb_x.checked_mul(self.tile_size);
        let height = self.nb_y.checked_mul(self.tile_size);
        match (width, height) {
            (Some(w), Some(h)) if w as u64 * h as u64 <= MAX_MOSAIC_PIXELS => Ok((w, h)),
            _ => Err(MapError::Configuration(format!(
                "{}x{} tiles at zoom {} exceed the {} pixel mosaic limit",
                self.nb_x, self.nb_y, self.zoom, MAX_MOSAIC_PIXELS
            ))),
        }
    }

    /// Upper-left corner of the mosaic.
    pub fn mosaic_origin(&self) -> (f64, f64) {
        (self.bbox.min_x, self.bbox.max_y)
    }

    /// Pixel offset of a tile of the block inside the mosaic.
    pub fn pixel_offset(&self, col: i64, row: i64) -> (i64, i64) {
        let ts = self.tile_size as i64;
        (
            (col - self.first_col) * ts,
            (row - self.first_row).abs() * ts,
        )
    }
}

/// The same bbox requested at several zoom levels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiZoomRequest {
    requests: BTreeMap<u32, BBoxRequest>,
}

impl MultiZoomRequest {
    pub fn new(tm: &TileMatrix, bbox: &BoundingBox, zooms: &[u32]) -> Self {
        let requests = zooms
            .iter()
            .map(|&z| (z, BBoxRequest::new(tm, bbox, z)))
            .collect();
        Self { requests }
    }

    pub fn get(&self, zoom: u32) -> Option<&BBoxRequest> {
        self.requests.get(&zoom)
    }

    pub fn zooms(&self) -> impl Iterator<Item = u32> + '_ {
        self.requests.keys().copied()
    }

    /// Every tile, coarsest level first.
    pub fn tiles(&self) -> Vec<TileAddress> {
        self.requests.values().flat_map(|r| r.tiles()).collect()
    }

    pub fn nb_tiles(&self) -> usize {
        self.requests.values().map(|r| r.nb_tiles()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::GridDefinition;
    use map_common::Crs;

    fn grid(origin: TileOrigin) -> TileMatrix {
        let def = GridDefinition::new("g", Crs::epsg(2154), BoundingBox::new(0.0, 0.0, 4096.0, 4096.0))
            .with_origin(origin)
            .with_progression(4.0, 2.0, 6);
        TileMatrix::new(&def).unwrap()
    }

    #[test]
    fn test_block_covers_bbox_north_west() {
        let tm = grid(TileOrigin::NorthWest);
        // Tile span at zoom 2 is 256 units
        let req = tm.bbox_request(&BoundingBox::new(300.0, 3100.0, 700.0, 3900.0), 2);
        assert_eq!((req.first_col(), req.first_row()), (1, 0));
        assert_eq!(req.cols(), vec![1, 2]);
        assert_eq!(req.rows(), vec![0, 1, 2, 3]);
        assert_eq!(req.nb_tiles(), 8);
        assert_eq!(req.mosaic_size().unwrap(), (512, 1024));
        assert_eq!(req.mosaic_origin(), (256.0, 4096.0));
        assert_eq!(req.pixel_offset(2, 3), (256, 768));
    }

    #[test]
    fn test_oversized_mosaic_rejected() {
        let tm = grid(TileOrigin::NorthWest);
        // 128x128 tiles of 32 units at zoom 5
        let req = tm.bbox_request(&BoundingBox::new(0.0, 0.0, 4096.0, 4096.0), 5);
        assert_eq!(req.nb_tiles_x(), 128);
        assert!(matches!(req.mosaic_size(), Err(MapError::Configuration(_))));

        // Tile counts this large overflow the pixel width
        let req = tm.bbox_request(&BoundingBox::new(0.0, -1e12, 1e12, 4096.0), 5);
        assert!(req.mosaic_size().is_err());
    }

    #[test]
    fn test_rows_descend_for_south_west_origin() {
        let tm = grid(TileOrigin::SouthWest);
        let req = tm.bbox_request(&BoundingBox::new(300.0, 3100.0, 700.0, 3900.0), 2);
        assert_eq!(req.first_row(), 15);
        assert_eq!(req.rows(), vec![15, 14, 13, 12]);
        assert_eq!(req.mosaic_origin(), (256.0, 4096.0));
        assert_eq!(req.pixel_offset(1, 12), (0, 768));
    }

    #[test]
    fn test_tiles_are_column_major() {
        let tm = grid(TileOrigin::NorthWest);
        let req = tm.bbox_request(&BoundingBox::new(0.0, 3072.0, 1024.0, 4096.0), 1);
        let tiles: Vec<_> = req.tiles().iter().map(|t| (t.col, t.row)).collect();
        assert_eq!(tiles, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_multi_zoom_request() {
        let tm = grid(TileOrigin::NorthWest);
        // One tile at zoom 0
        let bbox = BoundingBox::new(0.0, 3072.0, 1024.0, 4096.0);
        let req = MultiZoomRequest::new(&tm, &bbox, &[2, 0, 1]);
        assert_eq!(req.zooms().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(req.nb_tiles(), 1 + 4 + 16);
        assert_eq!(req.tiles()[0], TileAddress::new(0, 0, 0));
        assert_eq!(req.get(1).map(|r| r.nb_tiles()), Some(4));
        assert!(req.get(5).is_none());
    }
}
