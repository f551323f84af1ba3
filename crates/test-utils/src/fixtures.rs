//! Common test fixtures for basemap cache tests.

/// Web Mercator constants in meters.
pub mod mercator {
    /// Half the width of the Web Mercator square.
    pub const MAX_EXTENT: f64 = 20037508.342789244;

    /// Resolution of zoom level 0 with 256 pixel tiles.
    pub const RES_Z0: f64 = 2.0 * MAX_EXTENT / 256.0;

    /// Extent of one tile at `zoom`.
    pub fn tile_span(zoom: u32) -> f64 {
        2.0 * MAX_EXTENT / 2f64.powi(zoom as i32)
    }
}
