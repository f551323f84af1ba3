//! Raster side of the tile pipeline.
//!
//! - [`codec`]: format detection, decoding and encoding of tile payloads
//! - [`GeoImage`]: an RGBA buffer tied to an upper-left coordinate and a
//!   pixel size, used for mosaics and reprojected tiles
//! - [`warp`]: image reprojection through a control grid

pub mod codec;
pub mod geoimage;
pub mod warp;

pub use codec::{decode, encode, is_image, TileFormat};
pub use geoimage::{GeoImage, BACKGROUND, CORRUPT_TILE, EMPTY_TILE, TRANSPARENT};
pub use warp::{reproject, reproject_to, Resampling, WarpTarget};
