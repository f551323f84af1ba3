//! GeoPackage tables and the catalog rows describing the tile pyramid.

use map_common::{BoundingBox, MapError, MapResult};
use tile_grid::TileMatrix;

/// `PRAGMA application_id` of GeoPackage files ("GPKG").
pub const APPLICATION_ID: i64 = 1196437808;

/// Table holding the tiles; also the `table_name` of every catalog row.
pub const TILES_TABLE: &str = "gpkg_tiles";

pub(crate) const CREATE_SPATIAL_REF_SYS: &str = r#"
    CREATE TABLE gpkg_spatial_ref_sys (
        srs_name TEXT NOT NULL,
        srs_id INTEGER NOT NULL PRIMARY KEY,
        organization TEXT NOT NULL,
        organization_coordsys_id INTEGER NOT NULL,
        definition TEXT NOT NULL,
        description TEXT
    )
"#;

pub(crate) const CREATE_CONTENTS: &str = r#"
    CREATE TABLE gpkg_contents (
        table_name TEXT NOT NULL PRIMARY KEY,
        data_type TEXT NOT NULL,
        identifier TEXT UNIQUE,
        description TEXT DEFAULT '',
        last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        min_x DOUBLE,
        min_y DOUBLE,
        max_x DOUBLE,
        max_y DOUBLE,
        srs_id INTEGER,
        CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id)
            REFERENCES gpkg_spatial_ref_sys(srs_id)
    )
"#;

pub(crate) const CREATE_TILE_MATRIX_SET: &str = r#"
    CREATE TABLE gpkg_tile_matrix_set (
        table_name TEXT NOT NULL PRIMARY KEY,
        srs_id INTEGER NOT NULL,
        min_x DOUBLE NOT NULL,
        min_y DOUBLE NOT NULL,
        max_x DOUBLE NOT NULL,
        max_y DOUBLE NOT NULL,
        CONSTRAINT fk_gtms_table_name FOREIGN KEY (table_name)
            REFERENCES gpkg_contents(table_name),
        CONSTRAINT fk_gtms_srs FOREIGN KEY (srs_id)
            REFERENCES gpkg_spatial_ref_sys(srs_id)
    )
"#;

pub(crate) const CREATE_TILE_MATRIX: &str = r#"
    CREATE TABLE gpkg_tile_matrix (
        table_name TEXT NOT NULL,
        zoom_level INTEGER NOT NULL,
        matrix_width INTEGER NOT NULL,
        matrix_height INTEGER NOT NULL,
        tile_width INTEGER NOT NULL,
        tile_height INTEGER NOT NULL,
        pixel_x_size DOUBLE NOT NULL,
        pixel_y_size DOUBLE NOT NULL,
        CONSTRAINT pk_ttm PRIMARY KEY (table_name, zoom_level),
        CONSTRAINT fk_ttm_table_name FOREIGN KEY (table_name)
            REFERENCES gpkg_contents(table_name)
    )
"#;

pub(crate) const CREATE_TILES: &str = r#"
    CREATE TABLE gpkg_tiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        zoom_level INTEGER NOT NULL,
        tile_column INTEGER NOT NULL,
        tile_row INTEGER NOT NULL,
        tile_data BLOB NOT NULL,
        last_modified TIMESTAMP DEFAULT (datetime('now','localtime')),
        UNIQUE (zoom_level, tile_column, tile_row)
    )
"#;

/// Statements creating the schema, in foreign key order.
pub(crate) const CREATE_TABLES: [&str; 5] = [
    CREATE_SPATIAL_REF_SYS,
    CREATE_CONTENTS,
    CREATE_TILE_MATRIX_SET,
    CREATE_TILE_MATRIX,
    CREATE_TILES,
];

/// Probes a recognized cache must answer.
pub(crate) const PROBES: [&str; 5] = [
    "SELECT table_name FROM gpkg_contents LIMIT 1",
    "SELECT srs_name FROM gpkg_spatial_ref_sys LIMIT 1",
    "SELECT table_name FROM gpkg_tile_matrix_set LIMIT 1",
    "SELECT table_name FROM gpkg_tile_matrix LIMIT 1",
    "SELECT zoom_level, tile_column, tile_row, tile_data FROM gpkg_tiles LIMIT 1",
];

/// What the catalog tables record about the tile pyramid.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSet {
    pub auth: String,
    pub code: u32,
    pub bbox: BoundingBox,
    pub tile_size: u32,
    pub resolutions: Vec<f64>,
}

impl MatrixSet {
    /// Columns and rows of the matrix whose pixels are `res` wide.
    pub fn matrix_size(&self, res: f64) -> (i64, i64) {
        let span = self.tile_size as f64 * res;
        (
            (self.bbox.width() / span).ceil() as i64,
            (self.bbox.height() / span).ceil() as i64,
        )
    }
}

impl TryFrom<&TileMatrix> for MatrixSet {
    type Error = MapError;

    fn try_from(tm: &TileMatrix) -> MapResult<Self> {
        let (auth, code) = match (tm.crs().auth(), tm.crs().code()) {
            (Some(auth), Some(code)) => (auth.to_string(), code),
            _ => {
                return Err(MapError::Configuration(format!(
                    "tile cache needs an AUTH:CODE crs, grid '{}' uses {}",
                    tm.name(),
                    tm.crs()
                )))
            }
        };
        Ok(Self {
            auth,
            code,
            bbox: *tm.bbox(),
            tile_size: tm.tile_size(),
            resolutions: tm.get_res_list(),
        })
    }
}
