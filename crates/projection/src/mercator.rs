//! Spherical Web Mercator (EPSG:3857) closed forms.
//!
//! The sphere radius is the GRS80/WGS84 semi-major axis, so one degree of
//! longitude at the equator spans `2π·6378137/360` meters. The same constant
//! converts tile resolutions between degree and meter based grids.

use std::f64::consts::PI;

/// WGS84 / GRS80 semi-major axis in meters.
pub const EARTH_RADIUS: f64 = 6378137.0;

/// Meters per degree along the equator of the Web Mercator sphere.
pub const METERS_PER_DEGREE: f64 = 2.0 * PI * EARTH_RADIUS / 360.0;

/// Half the projected extent of the Web Mercator square (meters).
pub const MAX_EXTENT: f64 = PI * EARTH_RADIUS;

/// Latitude where the Web Mercator square ends (degrees).
pub const MAX_LATITUDE: f64 = 85.05112877980659;

/// Forward projection: lon/lat degrees to Web Mercator meters.
pub fn lonlat_to_webmerc(lon: f64, lat: f64) -> (f64, f64) {
    let k = METERS_PER_DEGREE;
    let x = lon * k;
    let y = ((90.0 + lat) * PI / 360.0).tan().ln() / (PI / 180.0) * k;
    (x, y)
}

/// Inverse projection: Web Mercator meters to lon/lat degrees.
pub fn webmerc_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let k = METERS_PER_DEGREE;
    let lon = x / k;
    let lat = 180.0 / PI * (2.0 * (y / k * PI / 180.0).exp().atan() - PI / 2.0);
    (lon, lat)
}

/// Convert a resolution expressed in degrees to meters.
pub fn degrees_to_meters(value: f64) -> f64 {
    value * METERS_PER_DEGREE
}

/// Convert a resolution expressed in meters to degrees.
pub fn meters_to_degrees(value: f64) -> f64 {
    value / METERS_PER_DEGREE
}
