//! Serializable grid definitions.

use map_common::{BoundingBox, Crs, MapError, MapResult};
use serde::{Deserialize, Serialize};

/// Corner of the grid bbox where tile (0, 0) sits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileOrigin {
    /// Rows grow southward (XYZ / WMTS layout).
    #[default]
    #[serde(rename = "NW", alias = "north_west", alias = "nw")]
    NorthWest,
    /// Rows grow northward (TMS / MBTiles layout).
    #[serde(rename = "SW", alias = "south_west", alias = "sw")]
    SouthWest,
}

/// A tiling scheme as written in a catalog.
///
/// Either `resolutions` is given, or the pyramid is derived from
/// `res_factor`, `init_res` and `nb_levels`. When `init_res` is absent,
/// level 0 fits the whole bbox in a single tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub crs: Crs,

    /// `[xmin, ymin, xmax, ymax]` in `bbox_crs`.
    pub bbox: [f64; 4],

    #[serde(default = "default_bbox_crs")]
    pub bbox_crs: Crs,

    #[serde(default = "default_tile_size")]
    pub tile_size: u32,

    #[serde(default)]
    pub origin: TileOrigin,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolutions: Option<Vec<f64>>,

    #[serde(default = "default_res_factor")]
    pub res_factor: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_res: Option<f64>,

    #[serde(default = "default_nb_levels")]
    pub nb_levels: u32,
}

fn default_bbox_crs() -> Crs {
    Crs::wgs84()
}

fn default_tile_size() -> u32 {
    256
}

fn default_res_factor() -> f64 {
    2.0
}

fn default_nb_levels() -> u32 {
    24
}

impl GridDefinition {
    /// Grid whose bbox is already expressed in its own CRS.
    pub fn new(name: impl Into<String>, crs: Crs, bbox: BoundingBox) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            bbox_crs: crs.clone(),
            crs,
            bbox: [bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y],
            tile_size: default_tile_size(),
            origin: TileOrigin::default(),
            resolutions: None,
            res_factor: default_res_factor(),
            init_res: None,
            nb_levels: default_nb_levels(),
        }
    }

    pub fn with_origin(mut self, origin: TileOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_resolutions(mut self, resolutions: Vec<f64>) -> Self {
        self.resolutions = Some(resolutions);
        self
    }

    pub fn with_progression(mut self, init_res: f64, res_factor: f64, nb_levels: u32) -> Self {
        self.init_res = Some(init_res);
        self.res_factor = res_factor;
        self.nb_levels = nb_levels;
        self
    }

    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(self.bbox[0], self.bbox[1], self.bbox[2], self.bbox[3])
    }

    /// Reject definitions no tile matrix can be built from.
    pub fn validate(&self) -> MapResult<()> {
        let invalid = |reason: String| {
            Err(MapError::Configuration(format!(
                "grid '{}': {}",
                self.name, reason
            )))
        };

        let bbox = self.bbox();
        if !bbox.is_valid() {
            return invalid(format!("degenerate bbox {:?}", self.bbox));
        }
        if self.tile_size == 0 {
            return invalid("tile_size must be positive".to_string());
        }

        match &self.resolutions {
            Some(resolutions) => {
                if resolutions.is_empty() {
                    return invalid("empty resolution list".to_string());
                }
                if resolutions.iter().any(|r| !(r.is_finite() && *r > 0.0)) {
                    return invalid("resolutions must be positive".to_string());
                }
                if resolutions.windows(2).any(|w| w[0] <= w[1]) {
                    return invalid("resolutions must be strictly decreasing".to_string());
                }
            }
            None => {
                if !(self.res_factor.is_finite() && self.res_factor > 1.0) {
                    return invalid(format!("res_factor {} must be > 1", self.res_factor));
                }
                if let Some(init_res) = self.init_res {
                    if !(init_res.is_finite() && init_res > 0.0) {
                        return invalid(format!("init_res {} must be positive", init_res));
                    }
                }
                if self.nb_levels == 0 {
                    return invalid("nb_levels must be at least 1".to_string());
                }
            }
        }
        Ok(())
    }
}
