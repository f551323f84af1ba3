//! Transformer interface implemented by every reprojection backend.

use async_trait::async_trait;
use map_common::{BoundingBox, MapError, MapResult};
use serde::{Deserialize, Serialize};

/// Reprojection backends, in the order `Auto` tries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Pick the first backend able to serve the CRS pair.
    #[default]
    Auto,
    /// proj4rs with the bundled EPSG definitions.
    Proj4,
    /// Closed forms for Web Mercator and UTM against WGS84.
    Builtin,
    /// EPSG.io web service.
    Remote,
}

impl EngineKind {
    /// Preference order used by `Auto`.
    pub const RANKED: [EngineKind; 3] = [EngineKind::Proj4, EngineKind::Builtin, EngineKind::Remote];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Auto => "auto",
            EngineKind::Proj4 => "proj4",
            EngineKind::Builtin => "builtin",
            EngineKind::Remote => "remote",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineKind {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(EngineKind::Auto),
            "proj4" => Ok(EngineKind::Proj4),
            "builtin" => Ok(EngineKind::Builtin),
            "remote" | "epsgio" => Ok(EngineKind::Remote),
            other => Err(MapError::Configuration(format!(
                "unknown reprojection engine '{}'",
                other
            ))),
        }
    }
}

/// Coordinate transformation between two fixed CRSs.
///
/// `points` is the only required method; single points and bounding boxes go
/// through it so that batching backends see one call per request.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Backend identifier, used in logs.
    fn kind(&self) -> EngineKind;

    /// Transform a list of (x, y) coordinates.
    async fn points(&self, points: &[(f64, f64)]) -> MapResult<Vec<(f64, f64)>>;

    /// Transform a single coordinate.
    async fn point(&self, x: f64, y: f64) -> MapResult<(f64, f64)> {
        self.points(&[(x, y)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MapError::Reprojection("backend returned no point".to_string()))
    }

    /// Transform the four corners of a bbox and return their envelope.
    async fn bbox(&self, bbox: &BoundingBox) -> MapResult<BoundingBox> {
        let corners = self.points(&bbox.corners()).await?;
        BoundingBox::from_points(&corners)
            .ok_or_else(|| MapError::Reprojection("backend returned no corners".to_string()))
    }
}
