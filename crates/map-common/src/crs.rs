//! Coordinate Reference System identifiers.
//!
//! A CRS is either an authority code (`EPSG:3857`) or a raw proj string
//! (`+proj=merc +a=6378137 ...`). Parsing normalizes the accepted spellings:
//! - `"3857"` (bare digits, EPSG assumed)
//! - `"epsg:3857"`, `"+init=epsg:3857"`
//! - `"+proj=longlat +datum=WGS84 +no_defs"`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{MapError, MapResult};

pub const EPSG_WGS84: u32 = 4326;
pub const EPSG_WEB_MERCATOR: u32 = 3857;

/// Geographic EPSG codes that are recognized without a projection library.
const GEOGRAPHIC_CODES: &[u32] = &[4326, 4269, 4258, 4171, 4230];

/// A normalized coordinate reference system identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Crs {
    /// Authority code, authority upper-cased (`EPSG`, `IGNF`, `ESRI`, ...).
    Code { auth: String, code: u32 },
    /// Raw proj string, every token starting with '+'.
    Proj(String),
}

impl Crs {
    /// Parse and normalize a CRS identifier.
    pub fn parse(s: &str) -> MapResult<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(MapError::invalid_crs(s));
        }

        if trimmed.chars().all(|c| c.is_ascii_digit()) {
            let code = trimmed.parse().map_err(|_| MapError::invalid_crs(s))?;
            return Ok(Crs::epsg(code));
        }

        let candidate = trimmed.strip_prefix("+init=").unwrap_or(trimmed);
        if let Some((auth, code)) = candidate.split_once(':') {
            if auth.is_empty() || !auth.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(MapError::invalid_crs(s));
            }
            if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
                return Err(MapError::invalid_crs(s));
            }
            let code = code.parse().map_err(|_| MapError::invalid_crs(s))?;
            return Ok(Crs::Code {
                auth: auth.to_uppercase(),
                code,
            });
        }

        if trimmed.split_whitespace().all(|token| token.starts_with('+')) {
            return Ok(Crs::Proj(trimmed.split_whitespace().collect::<Vec<_>>().join(" ")));
        }

        Err(MapError::invalid_crs(s))
    }

    pub fn epsg(code: u32) -> Self {
        Crs::Code {
            auth: "EPSG".to_string(),
            code,
        }
    }

    pub fn wgs84() -> Self {
        Crs::epsg(EPSG_WGS84)
    }

    pub fn web_mercator() -> Self {
        Crs::epsg(EPSG_WEB_MERCATOR)
    }

    /// Authority name, or `None` for proj strings.
    pub fn auth(&self) -> Option<&str> {
        match self {
            Crs::Code { auth, .. } => Some(auth),
            Crs::Proj(_) => None,
        }
    }

    /// Numeric code, or `None` for proj strings.
    pub fn code(&self) -> Option<u32> {
        match self {
            Crs::Code { code, .. } => Some(*code),
            Crs::Proj(_) => None,
        }
    }

    /// EPSG code if this CRS is an EPSG identifier.
    pub fn epsg_code(&self) -> Option<u32> {
        match self {
            Crs::Code { auth, code } if auth == "EPSG" => Some(*code),
            _ => None,
        }
    }

    pub fn is_epsg(&self) -> bool {
        self.epsg_code().is_some()
    }

    pub fn proj_string(&self) -> Option<&str> {
        match self {
            Crs::Proj(p) => Some(p),
            Crs::Code { .. } => None,
        }
    }

    pub fn is_web_mercator(&self) -> bool {
        self.epsg_code() == Some(EPSG_WEB_MERCATOR)
    }

    pub fn is_wgs84(&self) -> bool {
        self.epsg_code() == Some(EPSG_WGS84)
    }

    /// UTM zone and hemisphere (`true` for north) for WGS84 UTM codes.
    pub fn utm_zone(&self) -> Option<(u8, bool)> {
        match self.epsg_code()? {
            code @ 32601..=32660 => Some(((code - 32600) as u8, true)),
            code @ 32701..=32760 => Some(((code - 32700) as u8, false)),
            _ => None,
        }
    }

    pub fn is_utm(&self) -> bool {
        self.utm_zone().is_some()
    }

    /// Check if this is a geographic (lon/lat in degrees) CRS.
    pub fn is_geographic(&self) -> bool {
        match self {
            Crs::Code { .. } => self
                .epsg_code()
                .map(|code| GEOGRAPHIC_CODES.contains(&code))
                .unwrap_or(false),
            Crs::Proj(p) => p
                .split_whitespace()
                .any(|t| t == "+proj=longlat" || t == "+proj=latlong"),
        }
    }

    /// Axis order used in a WMS GetMap BBOX for the given protocol version.
    ///
    /// WMS 1.3.0 honours the CRS axis order, which is lat/lon for geographic
    /// EPSG codes. Earlier versions always use x/y.
    pub fn wms_axis_order(&self, version: &str) -> AxisOrder {
        if version == "1.3.0" && self.is_geographic() && self.is_epsg() {
            AxisOrder::LatLon
        } else {
            AxisOrder::XY
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crs::Code { auth, code } => write!(f, "{}:{}", auth, code),
            Crs::Proj(p) => write!(f, "{}", p),
        }
    }
}

impl FromStr for Crs {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Crs::parse(s)
    }
}

impl TryFrom<String> for Crs {
    type Error = MapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Crs::parse(&value)
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> Self {
        crs.to_string()
    }
}

/// Axis order for coordinate interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisOrder {
    /// X (longitude/easting), Y (latitude/northing)
    XY,
    /// Y (latitude/northing), X (longitude/easting)
    LatLon,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_code_assumes_epsg() {
        assert_eq!(Crs::parse("3857").unwrap(), Crs::web_mercator());
        assert_eq!(Crs::parse(" 4326 ").unwrap(), Crs::wgs84());
    }

    #[test]
    fn test_parse_auth_code() {
        assert_eq!(Crs::parse("epsg:2154").unwrap(), Crs::epsg(2154));
        assert_eq!(Crs::parse("+init=epsg:4326").unwrap(), Crs::wgs84());
        assert_eq!(
            Crs::parse("ignf:310024").unwrap(),
            Crs::Code {
                auth: "IGNF".into(),
                code: 310024
            }
        );
    }

    #[test]
    fn test_parse_proj_string() {
        let crs = Crs::parse("+proj=longlat  +datum=WGS84 +no_defs").unwrap();
        assert_eq!(crs.proj_string(), Some("+proj=longlat +datum=WGS84 +no_defs"));
        assert!(crs.is_geographic());
        assert!(!crs.is_epsg());
    }

    #[test]
    fn test_parse_invalid() {
        for bad in ["", "EPSG:", "EPSG:abc", "WGS 84", "proj=merc", ":4326", "EP SG:4326"] {
            assert!(
                matches!(Crs::parse(bad), Err(MapError::Configuration(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_flags() {
        assert!(Crs::web_mercator().is_web_mercator());
        assert!(Crs::wgs84().is_wgs84());
        assert!(Crs::wgs84().is_geographic());
        assert!(!Crs::web_mercator().is_geographic());
        assert_eq!(Crs::epsg(32631).utm_zone(), Some((31, true)));
        assert_eq!(Crs::epsg(32755).utm_zone(), Some((55, false)));
        assert!(!Crs::epsg(32600).is_utm());
        assert!(!Crs::epsg(2154).is_utm());
    }

    #[test]
    fn test_display_roundtrip() {
        let crs = Crs::parse("epsg:32631").unwrap();
        assert_eq!(crs.to_string(), "EPSG:32631");
        assert_eq!(Crs::parse(&crs.to_string()).unwrap(), crs);
    }

    #[test]
    fn test_wms_axis_order() {
        assert_eq!(Crs::wgs84().wms_axis_order("1.3.0"), AxisOrder::LatLon);
        assert_eq!(Crs::wgs84().wms_axis_order("1.1.1"), AxisOrder::XY);
        assert_eq!(Crs::web_mercator().wms_axis_order("1.3.0"), AxisOrder::XY);
    }

    #[test]
    fn test_serde_as_string() {
        let crs: Crs = serde_yaml::from_str("\"EPSG:3857\"").unwrap();
        assert_eq!(crs, Crs::web_mercator());
        let bad: Result<Crs, _> = serde_yaml::from_str("\"nonsense\"");
        assert!(bad.is_err());
    }
}
