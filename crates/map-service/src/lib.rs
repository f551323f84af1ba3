//! Cached access to remote map tiles.
//!
//! - [`config`]: source and grid catalog, service settings
//! - [`url`]: TMS, WMS and WMTS request URLs
//! - [`fetch`]: the HTTP transport behind [`TileFetcher`]
//! - [`MapService`]: cache lookups, concurrent downloads, mosaics and
//!   destination-grid tiles

pub mod config;
pub mod fetch;
pub mod progress;
pub mod service;
pub mod url;

pub use config::{Catalog, LayerDefinition, ServiceConfig, ServiceKind, SourceDefinition};
pub use fetch::{HttpFetcher, TileFetcher};
pub use progress::{ProgressSnapshot, Status};
pub use service::{ImageRequest, MapService, MapServiceBuilder, SeedSummary, SEED_BUFFER_SIZE};
