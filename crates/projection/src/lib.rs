//! Coordinate reference system transformations.
//!
//! Three backends sit behind the [`Transformer`] trait:
//! - proj4rs with the bundled EPSG table (cargo feature `proj4`)
//! - closed-form Web Mercator and UTM against WGS84
//! - the EPSG.io web service
//!
//! [`Reproj`] picks one for a CRS pair; [`ReprojEngine`] keeps the picks for
//! the lifetime of a service.

pub mod backend;
pub mod builtin;
pub mod config;
pub mod engine;
pub mod mercator;
#[cfg(feature = "proj4")]
pub mod proj4;
pub mod remote;
pub mod utm;

pub use backend::{EngineKind, Transformer};
pub use builtin::BuiltinTransformer;
pub use config::ProjectionConfig;
pub use engine::{Reproj, ReprojEngine};
pub use utm::Utm;
