//! Common types and utilities shared across the basemap cache crates.

pub mod bbox;
pub mod crs;
pub mod error;
pub mod tile;

pub use bbox::BoundingBox;
pub use crs::{AxisOrder, Crs};
pub use error::{MapError, MapResult};
pub use tile::{TileAddress, TileRecord};
