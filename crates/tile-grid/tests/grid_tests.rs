//! Tile arithmetic on the built-in global grids.

use map_common::{BoundingBox, TileAddress};
use projection::mercator::lonlat_to_webmerc;
use projection::{ProjectionConfig, ReprojEngine};
use test_utils::assert_approx_eq;
use tile_grid::presets::{WEB_MERCATOR, WEB_MERCATOR_SW, WGS84};
use tile_grid::{grid_preset, NearestRule, TileMatrix};

async fn matrix(key: &str) -> TileMatrix {
    let engine = ReprojEngine::new(ProjectionConfig::builtin_only()).unwrap();
    TileMatrix::from_definition(&grid_preset(key).unwrap(), &engine)
        .await
        .unwrap()
}

// ============================================================================
// Web Mercator
// ============================================================================

#[tokio::test]
async fn test_paris_tile_matches_xyz_scheme() {
    let tm = matrix(WEB_MERCATOR).await;
    let (x, y) = lonlat_to_webmerc(2.35, 48.85);
    assert_eq!(tm.get_tile_number(x, y, 10), (518, 352));
}

#[tokio::test]
async fn test_south_west_rows_are_flipped() {
    let nw = matrix(WEB_MERCATOR).await;
    let sw = matrix(WEB_MERCATOR_SW).await;
    let (x, y) = lonlat_to_webmerc(2.35, 48.85);
    for zoom in [1, 5, 10, 15] {
        let (col_nw, row_nw) = nw.get_tile_number(x, y, zoom);
        let (col_sw, row_sw) = sw.get_tile_number(x, y, zoom);
        assert_eq!(col_nw, col_sw);
        assert_eq!(row_sw, (1i64 << zoom) - 1 - row_nw, "zoom {}", zoom);

        let a = nw.get_tile_bbox(col_nw, row_nw, zoom);
        let b = sw.get_tile_bbox(col_sw, row_sw, zoom);
        assert_approx_eq!(a.min_y, b.min_y, 1e-6);
        assert_approx_eq!(a.max_y, b.max_y, 1e-6);
    }
}

#[tokio::test]
async fn test_every_level_zero_neighbour_out_of_bounds() {
    let tm = matrix(WEB_MERCATOR).await;
    assert!(tm.is_tile_in_bounds(0, 0, 0));
    assert!(!tm.is_tile_in_bounds(1, 0, 0));
    assert!(!tm.is_tile_in_bounds(0, 1, 0));
    assert!(tm.is_address_in_bounds(&TileAddress::new(1023, 1023, 10)));
    assert!(!tm.is_address_in_bounds(&TileAddress::new(1024, 0, 10)));
}

#[tokio::test]
async fn test_nearest_zoom_for_meter_resolution() {
    let tm = matrix(WEB_MERCATOR).await;
    // Level 17 is about 1.19 m per pixel, level 18 about 0.6 m
    assert_eq!(tm.get_nearest_zoom(1.0, NearestRule::Closer), 17);
    assert_eq!(tm.get_nearest_zoom(1.0, NearestRule::Higher), 18);
    assert_eq!(tm.get_nearest_zoom(1.0, NearestRule::Lower), 17);
}

#[tokio::test]
async fn test_full_extent_request_at_zoom_two() {
    let tm = matrix(WEB_MERCATOR).await;
    let req = tm.bbox_request(tm.bbox(), 2);
    assert_eq!(req.nb_tiles(), 16);
    assert_eq!(req.mosaic_size().unwrap(), (1024, 1024));
}

// ============================================================================
// Geographic grid
// ============================================================================

#[tokio::test]
async fn test_geographic_request_snaps_to_tiles() {
    let tm = matrix(WGS84).await;
    // 45 x 45 degree tiles at zoom 3
    let req = tm.bbox_request(&BoundingBox::new(10.0, 10.0, 50.0, 50.0), 3);
    assert_eq!((req.first_col(), req.first_row()), (4, 0));
    assert_eq!(req.cols(), vec![4, 5]);
    assert_eq!(req.rows(), vec![0, 1]);
    assert_eq!(req.mosaic_origin(), (0.0, 90.0));
}
