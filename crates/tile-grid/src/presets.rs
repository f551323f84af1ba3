//! Built-in grids.

use std::collections::BTreeMap;

use map_common::{MapError, MapResult};

use crate::definition::GridDefinition;

pub const WEB_MERCATOR: &str = "WM";
pub const WEB_MERCATOR_SW: &str = "WM_SW";
pub const WGS84: &str = "WGS84";
pub const WGS84_SW: &str = "WGS84_SW";
pub const LAMBERT93: &str = "LB93";
pub const LAMBERT93_2: &str = "LB93_2";
pub const LAMBERT93_CRAIG: &str = "LB93_CRAIG";

const GRIDS_YAML: &str = include_str!("grids.yaml");

/// Parse a `key -> definition` map and validate every entry.
pub fn parse_grids(yaml: &str) -> MapResult<BTreeMap<String, GridDefinition>> {
    let grids: BTreeMap<String, GridDefinition> = serde_yaml::from_str(yaml)?;
    for def in grids.values() {
        def.validate()?;
    }
    Ok(grids)
}

/// All built-in grids, keyed by their catalog key.
pub fn grid_presets() -> MapResult<BTreeMap<String, GridDefinition>> {
    parse_grids(GRIDS_YAML)
}

pub fn grid_preset(key: &str) -> MapResult<GridDefinition> {
    grid_presets()?
        .remove(key)
        .ok_or_else(|| MapError::Configuration(format!("unknown grid '{}'", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TileOrigin;
    use crate::matrix::{TileMatrix, Units};
    use map_common::Crs;
    use projection::{ProjectionConfig, ReprojEngine};
    use test_utils::{assert_approx_eq, fixtures::mercator};

    #[test]
    fn test_embedded_presets_parse() {
        let grids = grid_presets().unwrap();
        let keys: Vec<_> = grids.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                LAMBERT93,
                LAMBERT93_2,
                LAMBERT93_CRAIG,
                WGS84,
                WGS84_SW,
                WEB_MERCATOR,
                WEB_MERCATOR_SW
            ]
        );
        assert_eq!(grids[WEB_MERCATOR_SW].origin, TileOrigin::SouthWest);
        assert_eq!(grids[LAMBERT93_2].origin, TileOrigin::SouthWest);
    }

    #[test]
    fn test_unknown_preset() {
        assert!(matches!(grid_preset("NOPE"), Err(MapError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_web_mercator_matrix() {
        let engine = ReprojEngine::new(ProjectionConfig::builtin_only()).unwrap();
        let tm = TileMatrix::from_definition(&grid_preset(WEB_MERCATOR).unwrap(), &engine)
            .await
            .unwrap();
        assert_eq!(tm.crs(), &Crs::web_mercator());
        assert_approx_eq!(tm.bbox().max_x, mercator::MAX_EXTENT, 1e-6);
        assert_approx_eq!(tm.bbox().max_y, mercator::MAX_EXTENT, 1e-3);
        assert_approx_eq!(tm.get_res(0), mercator::RES_Z0, 1e-6);
        assert_eq!(tm.units(), Units::Meters);
        assert_eq!(tm.nb_levels(), 24);
    }

    #[tokio::test]
    async fn test_wgs84_matrix() {
        let engine = ReprojEngine::new(ProjectionConfig::builtin_only()).unwrap();
        let tm = TileMatrix::from_definition(&grid_preset(WGS84).unwrap(), &engine)
            .await
            .unwrap();
        assert_eq!(tm.origin_coords(), (-180.0, 90.0));
        assert_eq!(tm.get_res(1), 360.0 / 512.0);
        assert!(tm.is_tile_in_bounds(0, 0, 0));
        assert_eq!(tm.matrix_size(1), (2, 1));
    }

    #[tokio::test]
    async fn test_lambert93_matrices() {
        let engine = ReprojEngine::new(ProjectionConfig::builtin_only()).unwrap();
        let lb93 = TileMatrix::from_definition(&grid_preset(LAMBERT93).unwrap(), &engine)
            .await
            .unwrap();
        assert_eq!(lb93.crs(), &Crs::epsg(2154));
        assert_eq!(lb93.units(), Units::Meters);
        assert_eq!(lb93.origin_coords(), (99200.0, 7110500.0));
        // Level 0 fits the wider side in one tile
        assert_approx_eq!(lb93.get_res(0), 1143300.0 / 256.0, 1e-9);

        let listed = TileMatrix::from_definition(&grid_preset(LAMBERT93_2).unwrap(), &engine)
            .await
            .unwrap();
        assert_eq!(listed.nb_levels(), 15);
        assert_eq!(listed.get_res(8), 10.0);
        assert_eq!(listed.origin_coords(), (99200.0, 6049600.0));

        let craig = TileMatrix::from_definition(&grid_preset(LAMBERT93_CRAIG).unwrap(), &engine)
            .await
            .unwrap();
        assert_eq!(craig.get_res(0), 1354.666);
        assert_eq!(craig.get_res(2), 1354.666 / 4.0);
    }
}
