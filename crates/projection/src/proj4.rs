//! General-purpose transformer backed by proj4rs.
//!
//! EPSG codes are resolved through the `crs-definitions` table; raw proj
//! strings are used as given. proj4rs works in radians for geographic
//! systems, so degrees are converted on the way in and out.

use async_trait::async_trait;
use map_common::{Crs, MapError, MapResult};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::backend::{EngineKind, Transformer};

/// Resolve a CRS to a proj definition string.
pub fn proj_definition(crs: &Crs) -> Option<String> {
    match crs {
        Crs::Proj(p) => Some(p.clone()),
        Crs::Code { .. } => crs
            .epsg_code()
            .and_then(|code| u16::try_from(code).ok())
            .and_then(crs_definitions::from_code)
            .map(|def| def.proj4.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct Proj4Transformer {
    src_def: String,
    dst_def: String,
    src_is_geo: bool,
    dst_is_geo: bool,
}

impl Proj4Transformer {
    /// Returns `None` when either side has no usable proj definition.
    pub fn new(src: &Crs, dst: &Crs) -> Option<Self> {
        let src_def = proj_definition(src)?;
        let dst_def = proj_definition(dst)?;
        let src_proj = Proj::from_proj_string(&src_def).ok()?;
        let dst_proj = Proj::from_proj_string(&dst_def).ok()?;
        Some(Self {
            src_is_geo: src_proj.is_latlong(),
            dst_is_geo: dst_proj.is_latlong(),
            src_def,
            dst_def,
        })
    }

    fn projections(&self) -> MapResult<(Proj, Proj)> {
        let src = Proj::from_proj_string(&self.src_def)
            .map_err(|e| MapError::Reprojection(format!("{}: {:?}", self.src_def, e)))?;
        let dst = Proj::from_proj_string(&self.dst_def)
            .map_err(|e| MapError::Reprojection(format!("{}: {:?}", self.dst_def, e)))?;
        Ok((src, dst))
    }
}

#[async_trait]
impl Transformer for Proj4Transformer {
    fn kind(&self) -> EngineKind {
        EngineKind::Proj4
    }

    async fn points(&self, points: &[(f64, f64)]) -> MapResult<Vec<(f64, f64)>> {
        let (src, dst) = self.projections()?;
        points
            .iter()
            .map(|&(x, y)| {
                let mut point = if self.src_is_geo {
                    (x.to_radians(), y.to_radians(), 0.0)
                } else {
                    (x, y, 0.0)
                };
                transform(&src, &dst, &mut point).map_err(|e| {
                    MapError::Reprojection(format!("proj4 transform of ({}, {}) failed: {:?}", x, y, e))
                })?;
                if self.dst_is_geo {
                    Ok((point.0.to_degrees(), point.1.to_degrees()))
                } else {
                    Ok((point.0, point.1))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mercator::lonlat_to_webmerc;
    use test_utils::assert_approx_eq;

    #[test]
    fn test_unknown_code_is_unsupported() {
        assert!(Proj4Transformer::new(&Crs::epsg(99999), &Crs::wgs84()).is_none());
    }

    #[tokio::test]
    async fn test_matches_builtin_web_mercator() {
        let t = Proj4Transformer::new(&Crs::wgs84(), &Crs::web_mercator()).unwrap();
        let (x, y) = t.point(12.5, 41.9).await.unwrap();
        let (bx, by) = lonlat_to_webmerc(12.5, 41.9);
        assert_approx_eq!(x, bx, 1e-3);
        assert_approx_eq!(y, by, 1e-3);
    }

    #[tokio::test]
    async fn test_lambert93_roundtrip() {
        let fwd = Proj4Transformer::new(&Crs::wgs84(), &Crs::epsg(2154)).unwrap();
        let inv = Proj4Transformer::new(&Crs::epsg(2154), &Crs::wgs84()).unwrap();
        let (x, y) = fwd.point(2.35, 48.85).await.unwrap();
        assert!(x > 600_000.0 && x < 700_000.0, "x = {}", x);
        assert!(y > 6_800_000.0 && y < 6_900_000.0, "y = {}", y);
        let (lon, lat) = inv.point(x, y).await.unwrap();
        assert_approx_eq!(lon, 2.35, 1e-7);
        assert_approx_eq!(lat, 48.85, 1e-7);
    }
}
