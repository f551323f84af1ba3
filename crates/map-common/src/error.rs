//! Error types for the basemap cache crates.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using MapError.
pub type MapResult<T> = Result<T, MapError>;

/// Primary error type for tile, cache and reprojection operations.
#[derive(Debug, Error)]
pub enum MapError {
    // === Configuration Errors ===
    /// Missing destination grid, invalid CRS, unknown source/layer/grid,
    /// or a requested reprojection engine that cannot serve the CRS pair.
    #[error("Configuration error: {0}")]
    Configuration(String),

    // === Per-tile Errors ===
    #[error("Network failure: {0}")]
    Network(String),

    #[error("Corrupt tile data: {0}")]
    CorruptData(String),

    #[error("Reprojection failed: {0}")]
    Reprojection(String),

    // === Storage Errors ===
    #[error("File at {path} is not a recognized tile cache: {reason}")]
    CacheSchema { path: PathBuf, reason: String },

    #[error("Cache error: {0}")]
    Cache(String),

    // === Raster Errors ===
    #[error("Image error: {0}")]
    Image(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MapError {
    /// Shorthand for the most common configuration failure.
    pub fn invalid_crs(value: impl std::fmt::Display) -> Self {
        MapError::Configuration(format!("invalid CRS '{}'", value))
    }

    /// Errors that only cost a single tile and are absorbed by the service.
    pub fn is_tile_local(&self) -> bool {
        matches!(
            self,
            MapError::Network(_) | MapError::CorruptData(_) | MapError::Reprojection(_)
        )
    }
}

impl From<serde_yaml::Error> for MapError {
    fn from(err: serde_yaml::Error) -> Self {
        MapError::Configuration(format!("YAML error: {}", err))
    }
}
