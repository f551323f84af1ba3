//! Tile matrices: how a CRS is cut into a pyramid of square tiles.
//!
//! A [`GridDefinition`] is the serializable description (YAML catalogs and
//! the built-in [`presets`]); a [`TileMatrix`] is the validated, immutable
//! form with the bbox expressed in the grid CRS and all tile arithmetic.
//! [`BBoxRequest`] lists the tiles covering an extent at one zoom level.

pub mod definition;
pub mod matrix;
pub mod presets;
pub mod request;

pub use definition::{GridDefinition, TileOrigin};
pub use matrix::{NearestRule, TileMatrix, Units};
pub use presets::{grid_preset, grid_presets};
pub use request::{BBoxRequest, MultiZoomRequest, MAX_MOSAIC_PIXELS};
