//! Built-in transformer: Web Mercator and UTM to and from WGS84.
//!
//! Works without any projection library or network access, which makes it
//! the fallback for the two grids most tile services use.

use async_trait::async_trait;
use map_common::{Crs, MapError, MapResult};

use crate::backend::{EngineKind, Transformer};
use crate::mercator::{lonlat_to_webmerc, webmerc_to_lonlat};
use crate::utm::Utm;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Endpoint {
    Wgs84,
    WebMercator,
    Utm(Utm),
}

impl Endpoint {
    fn from_crs(crs: &Crs) -> Option<Self> {
        if crs.is_wgs84() {
            Some(Endpoint::Wgs84)
        } else if crs.is_web_mercator() {
            Some(Endpoint::WebMercator)
        } else {
            Utm::from_crs(crs).map(Endpoint::Utm)
        }
    }
}

/// Closed-form transformer for (Web Mercator | UTM) <-> WGS84.
#[derive(Debug, Clone)]
pub struct BuiltinTransformer {
    src: Endpoint,
    dst: Endpoint,
}

impl BuiltinTransformer {
    /// Returns `None` when the pair is not covered.
    pub fn new(src: &Crs, dst: &Crs) -> Option<Self> {
        let src = Endpoint::from_crs(src)?;
        let dst = Endpoint::from_crs(dst)?;
        match (src, dst) {
            (Endpoint::Wgs84, Endpoint::WebMercator | Endpoint::Utm(_))
            | (Endpoint::WebMercator | Endpoint::Utm(_), Endpoint::Wgs84) => Some(Self { src, dst }),
            _ => None,
        }
    }

    fn transform(&self, x: f64, y: f64) -> MapResult<(f64, f64)> {
        match (self.src, self.dst) {
            (Endpoint::Wgs84, Endpoint::WebMercator) => Ok(lonlat_to_webmerc(x, y)),
            (Endpoint::WebMercator, Endpoint::Wgs84) => Ok(webmerc_to_lonlat(x, y)),
            (Endpoint::Wgs84, Endpoint::Utm(utm)) => utm.to_utm(x, y),
            (Endpoint::Utm(utm), Endpoint::Wgs84) => utm.to_lonlat(x, y),
            _ => Err(MapError::Reprojection(
                "unsupported built-in transformation".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Transformer for BuiltinTransformer {
    fn kind(&self) -> EngineKind {
        EngineKind::Builtin
    }

    async fn points(&self, points: &[(f64, f64)]) -> MapResult<Vec<(f64, f64)>> {
        points.iter().map(|&(x, y)| self.transform(x, y)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::assert_approx_eq;

    #[test]
    fn test_supported_pairs() {
        let wgs = Crs::wgs84();
        let wm = Crs::web_mercator();
        let utm = Crs::epsg(32631);
        assert!(BuiltinTransformer::new(&wm, &wgs).is_some());
        assert!(BuiltinTransformer::new(&wgs, &wm).is_some());
        assert!(BuiltinTransformer::new(&utm, &wgs).is_some());
        assert!(BuiltinTransformer::new(&wgs, &utm).is_some());
        assert!(BuiltinTransformer::new(&wm, &utm).is_none());
        assert!(BuiltinTransformer::new(&Crs::epsg(2154), &wgs).is_none());
        assert!(BuiltinTransformer::new(&wgs, &wgs).is_none());
    }

    #[tokio::test]
    async fn test_bbox_uses_corner_envelope() {
        let t = BuiltinTransformer::new(&Crs::wgs84(), &Crs::web_mercator()).unwrap();
        let bbox = t
            .bbox(&map_common::BoundingBox::new(-180.0, -85.0, 180.0, 85.0))
            .await
            .unwrap();
        assert_approx_eq!(bbox.min_x, -20037508.342789244, 1e-6);
        assert_approx_eq!(bbox.max_x, 20037508.342789244, 1e-6);
        assert!((bbox.max_y + bbox.min_y).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_utm_failure_surfaces_as_reprojection_error() {
        let t = BuiltinTransformer::new(&Crs::epsg(32631), &Crs::wgs84()).unwrap();
        let err = t.point(5.0, 5.0).await.unwrap_err();
        assert!(matches!(err, MapError::Reprojection(_)));
    }
}
