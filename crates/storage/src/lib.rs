//! On-disk tile cache in the GeoPackage tiles layout.
//!
//! One SQLite file holds the tiles of one (source, layer, grid) triple.
//! Every operation opens its own connection and closes it before returning,
//! so caches can be shared between tasks without a pool.

pub mod gpkg;
pub mod schema;

pub use gpkg::{GeoPackage, MatrixLevel, DEFAULT_MAX_AGE_DAYS, QUERY_CHUNK_SIZE};
pub use schema::{MatrixSet, APPLICATION_ID};
