//! Universal Transverse Mercator on the WGS84 datum.
//!
//! Krüger series truncated at the usual order (accuracy well under a
//! millimetre inside a zone). Only plain zones are handled, no MGRS latitude
//! bands. Each zone maps to EPSG 326xx (north) or 327xx (south).

use map_common::{Crs, MapError, MapResult};

const K0: f64 = 0.9996;
const R: f64 = 6378137.0;

const E: f64 = 0.00669438;
const E2: f64 = E * E;
const E3: f64 = E2 * E;
const E_P2: f64 = E / (1.0 - E);

const M1: f64 = 1.0 - E / 4.0 - 3.0 * E2 / 64.0 - 5.0 * E3 / 256.0;
const M2: f64 = 3.0 * E / 8.0 + 3.0 * E2 / 32.0 + 45.0 * E3 / 1024.0;
const M3: f64 = 15.0 * E2 / 256.0 + 45.0 * E3 / 1024.0;
const M4: f64 = 35.0 * E3 / 3072.0;

const FALSE_EASTING: f64 = 500000.0;
const FALSE_NORTHING_SOUTH: f64 = 10000000.0;

/// Footpoint latitude series coefficients, from `_e = (1 - sqrt(1-e²)) / (1 + sqrt(1-e²))`.
struct Footpoint {
    p2: f64,
    p3: f64,
    p4: f64,
    p5: f64,
}

impl Footpoint {
    fn new() -> Self {
        let sqrt_e = (1.0 - E).sqrt();
        let e1 = (1.0 - sqrt_e) / (1.0 + sqrt_e);
        let e2 = e1 * e1;
        let e3 = e2 * e1;
        let e4 = e3 * e1;
        let e5 = e4 * e1;
        Self {
            p2: 3.0 / 2.0 * e1 - 27.0 / 32.0 * e3 + 269.0 / 512.0 * e5,
            p3: 21.0 / 16.0 * e2 - 55.0 / 32.0 * e4,
            p4: 151.0 / 96.0 * e3 - 417.0 / 128.0 * e5,
            p5: 1097.0 / 512.0 * e4,
        }
    }
}

/// A UTM zone with its hemisphere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utm {
    pub zone: u8,
    pub north: bool,
}

impl Utm {
    pub fn new(zone: u8, north: bool) -> MapResult<Self> {
        if !(1..=60).contains(&zone) {
            return Err(MapError::Configuration(format!(
                "UTM zone {} out of range (must be between 1 and 60)",
                zone
            )));
        }
        Ok(Self { zone, north })
    }

    /// Zone for a WGS84 UTM EPSG code (32601..32660, 32701..32760).
    pub fn from_crs(crs: &Crs) -> Option<Self> {
        crs.utm_zone().map(|(zone, north)| Self { zone, north })
    }

    /// Zone containing a lon/lat position.
    pub fn from_lonlat(lon: f64, lat: f64) -> MapResult<Self> {
        let zone = (((lon + 180.0) / 6.0) as i64 + 1).clamp(1, 60) as u8;
        Self::new(zone, lat >= 0.0)
    }

    pub fn epsg_code(&self) -> u32 {
        if self.north {
            32600 + self.zone as u32
        } else {
            32700 + self.zone as u32
        }
    }

    pub fn central_longitude(&self) -> f64 {
        (self.zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
    }

    /// Easting/northing (meters) to lon/lat (degrees).
    pub fn to_lonlat(&self, easting: f64, northing: f64) -> MapResult<(f64, f64)> {
        if !(100000.0..1000000.0).contains(&easting) {
            return Err(MapError::Reprojection(format!(
                "easting {} out of range (must be between 100000 m and 999999 m)",
                easting
            )));
        }
        if !(0.0..=10000000.0).contains(&northing) {
            return Err(MapError::Reprojection(format!(
                "northing {} out of range (must be between 0 m and 10000000 m)",
                northing
            )));
        }

        let fp = Footpoint::new();
        let x = easting - FALSE_EASTING;
        let mut y = northing;
        if !self.north {
            y -= FALSE_NORTHING_SOUTH;
        }

        let m = y / K0;
        let mu = m / (R * M1);

        let p_rad = mu
            + fp.p2 * (2.0 * mu).sin()
            + fp.p3 * (4.0 * mu).sin()
            + fp.p4 * (6.0 * mu).sin()
            + fp.p5 * (8.0 * mu).sin();

        let p_sin = p_rad.sin();
        let p_sin2 = p_sin * p_sin;
        let p_cos = p_rad.cos();

        let p_tan = p_sin / p_cos;
        let p_tan2 = p_tan * p_tan;
        let p_tan4 = p_tan2 * p_tan2;

        let ep_sin = 1.0 - E * p_sin2;
        let ep_sin_sqrt = ep_sin.sqrt();

        let n = R / ep_sin_sqrt;
        let r = (1.0 - E) / ep_sin;

        let c = E_P2 * p_cos * p_cos;
        let c2 = c * c;

        let d = x / (n * K0);
        let d2 = d * d;
        let d3 = d2 * d;
        let d4 = d3 * d;
        let d5 = d4 * d;
        let d6 = d5 * d;

        let latitude = p_rad
            - (p_tan / r)
                * (d2 / 2.0 - d4 / 24.0 * (5.0 + 3.0 * p_tan2 + 10.0 * c - 4.0 * c2 - 9.0 * E_P2)
                    + d6 / 720.0
                        * (61.0 + 90.0 * p_tan2 + 298.0 * c + 45.0 * p_tan4 - 252.0 * E_P2 - 3.0 * c2));

        let longitude = (d - d3 / 6.0 * (1.0 + 2.0 * p_tan2 + c)
            + d5 / 120.0 * (5.0 - 2.0 * c + 28.0 * p_tan2 - 3.0 * c2 + 8.0 * E_P2 + 24.0 * p_tan4))
            / p_cos;

        Ok((
            longitude.to_degrees() + self.central_longitude(),
            latitude.to_degrees(),
        ))
    }

    /// Lon/lat (degrees) to easting/northing (meters).
    pub fn to_utm(&self, longitude: f64, latitude: f64) -> MapResult<(f64, f64)> {
        if !(-80.0..=84.0).contains(&latitude) {
            return Err(MapError::Reprojection(format!(
                "latitude {} out of range (must be between 80 deg S and 84 deg N)",
                latitude
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(MapError::Reprojection(format!(
                "longitude {} out of range (must be between 180 deg W and 180 deg E)",
                longitude
            )));
        }

        let lat_rad = latitude.to_radians();
        let lat_sin = lat_rad.sin();
        let lat_cos = lat_rad.cos();

        let lat_tan = lat_sin / lat_cos;
        let lat_tan2 = lat_tan * lat_tan;
        let lat_tan4 = lat_tan2 * lat_tan2;

        let lon_rad = longitude.to_radians();
        let central_lon_rad = self.central_longitude().to_radians();

        let n = R / (1.0 - E * lat_sin * lat_sin).sqrt();
        let c = E_P2 * lat_cos * lat_cos;

        let a = lat_cos * (lon_rad - central_lon_rad);
        let a2 = a * a;
        let a3 = a2 * a;
        let a4 = a3 * a;
        let a5 = a4 * a;
        let a6 = a5 * a;

        let m = R
            * (M1 * lat_rad - M2 * (2.0 * lat_rad).sin() + M3 * (4.0 * lat_rad).sin()
                - M4 * (6.0 * lat_rad).sin());

        let easting = K0
            * n
            * (a + a3 / 6.0 * (1.0 - lat_tan2 + c)
                + a5 / 120.0 * (5.0 - 18.0 * lat_tan2 + lat_tan4 + 72.0 * c - 58.0 * E_P2))
            + FALSE_EASTING;

        let mut northing = K0
            * (m + n
                * lat_tan
                * (a2 / 2.0
                    + a4 / 24.0 * (5.0 - lat_tan2 + 9.0 * c + 4.0 * c * c)
                    + a6 / 720.0 * (61.0 - 58.0 * lat_tan2 + lat_tan4 + 600.0 * c - 330.0 * E_P2)));

        if !self.north {
            northing += FALSE_NORTHING_SOUTH;
        }

        Ok((easting, northing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::assert_approx_eq;

    #[test]
    fn test_zone_from_epsg() {
        assert_eq!(Utm::from_crs(&Crs::epsg(32631)), Some(Utm { zone: 31, north: true }));
        assert_eq!(Utm::from_crs(&Crs::epsg(32718)), Some(Utm { zone: 18, north: false }));
        assert_eq!(Utm::from_crs(&Crs::epsg(3857)), None);
    }

    #[test]
    fn test_zone_from_lonlat() {
        let utm = Utm::from_lonlat(2.35, 48.85).unwrap();
        assert_eq!(utm.zone, 31);
        assert!(utm.north);
        assert_eq!(utm.epsg_code(), 32631);
        assert_eq!(Utm::from_lonlat(-74.0, -12.0).unwrap().epsg_code(), 32718);
        assert_eq!(Utm::from_lonlat(180.0, 0.0).unwrap().zone, 60);
    }

    #[test]
    fn test_central_meridian_point() {
        let utm = Utm::new(31, true).unwrap();
        let (e, n) = utm.to_utm(3.0, 45.0).unwrap();
        assert_approx_eq!(e, 500000.0, 1e-6);
        assert_approx_eq!(n, 4982950.4, 0.5);
    }

    #[test]
    fn test_roundtrip_north_and_south() {
        let cases = [
            (Utm::new(31, true).unwrap(), 2.3522, 48.8566),
            (Utm::new(33, true).unwrap(), 10.75, 59.91),
            (Utm::new(56, false).unwrap(), 151.21, -33.87),
            (Utm::new(18, false).unwrap(), -77.04, -12.05),
        ];
        for (utm, lon, lat) in cases {
            let (e, n) = utm.to_utm(lon, lat).unwrap();
            let (lon2, lat2) = utm.to_lonlat(e, n).unwrap();
            assert_approx_eq!(lon2, lon, 1e-6);
            assert_approx_eq!(lat2, lat, 1e-6);
        }
    }

    #[test]
    fn test_out_of_range() {
        let utm = Utm::new(31, true).unwrap();
        assert!(matches!(utm.to_lonlat(50000.0, 10.0), Err(MapError::Reprojection(_))));
        assert!(matches!(utm.to_lonlat(500000.0, -1.0), Err(MapError::Reprojection(_))));
        assert!(matches!(utm.to_utm(3.0, 85.0), Err(MapError::Reprojection(_))));
        assert!(Utm::new(0, true).is_err());
        assert!(Utm::new(61, true).is_err());
    }
}
