//! Tile source catalog and service settings.
//!
//! Sources and grids are declared in YAML. The built-in catalog bundles the
//! grid presets of `tile-grid` and the sources of `sources.yaml`; user files
//! are merged over it, so a user entry replaces a preset with the same key.

use std::collections::BTreeMap;
use std::path::Path;

use map_common::{MapError, MapResult};
use projection::ProjectionConfig;
use raster::{Resampling, TileFormat};
use serde::{Deserialize, Serialize};
use tile_grid::{grid_presets, GridDefinition};
use tracing::{debug, info};

const BUILTIN_SOURCES: &str = include_str!("sources.yaml");

/// Protocol spoken by a tile source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceKind {
    /// XYZ tiles addressed through a URL template.
    Tms,
    /// OGC Web Map Service, one GetMap per tile.
    Wms,
    /// OGC Web Map Tile Service.
    Wmts,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Tms => "TMS",
            ServiceKind::Wms => "WMS",
            ServiceKind::Wmts => "WMTS",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One layer of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDefinition {
    /// Value substituted for `{LAY}` (or the LAYER(S) parameter).
    #[serde(default)]
    pub url_key: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Image format requested from the server.
    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default)]
    pub style: String,

    #[serde(default)]
    pub zmin: u32,

    #[serde(default = "default_zmax")]
    pub zmax: u32,
}

fn default_format() -> String {
    "png".to_string()
}

fn default_zmax() -> u32 {
    24
}

impl LayerDefinition {
    /// Encoding used for tiles built locally for this layer.
    pub fn tile_format(&self) -> TileFormat {
        TileFormat::parse(&self.format).unwrap_or_default()
    }

    /// Clamp a zoom level into the layer bounds.
    pub fn clamp_zoom(&self, zoom: u32) -> u32 {
        zoom.clamp(self.zmin, self.zmax)
    }

    pub fn has_zoom(&self, zoom: u32) -> bool {
        (self.zmin..=self.zmax).contains(&zoom)
    }
}

/// A remote tile source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub service: ServiceKind,

    /// Key of the grid the server tiles are aligned on.
    pub grid: String,

    /// URL template for TMS sources, base URL for WMS and WMTS ones.
    pub url: String,

    /// Address TMS tiles with a Bing quadkey instead of `{X}{Y}{Z}`.
    #[serde(default)]
    pub quadkey: bool,

    #[serde(default)]
    pub referer: String,

    /// Protocol version; defaults to 1.1.1 for WMS and 1.0.0 for WMTS.
    #[serde(default)]
    pub version: Option<String>,

    /// TILEMATRIXSET identifier of a WMTS source.
    #[serde(default)]
    pub matrix: Option<String>,

    pub layers: BTreeMap<String, LayerDefinition>,
}

impl SourceDefinition {
    /// Protocol version sent in WMS and WMTS requests.
    pub fn version(&self) -> &str {
        match (&self.version, self.service) {
            (Some(version), _) => version,
            (None, ServiceKind::Wmts) => "1.0.0",
            (None, _) => "1.1.1",
        }
    }

    pub fn layer(&self, key: &str) -> MapResult<&LayerDefinition> {
        self.layers.get(key).ok_or_else(|| {
            MapError::Configuration(format!(
                "unknown layer '{}' for source '{}' (available: {})",
                key,
                self.name,
                self.layers.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    fn validate(&self, key: &str) -> MapResult<()> {
        let invalid = |reason: String| {
            Err(MapError::Configuration(format!(
                "source '{}': {}",
                key, reason
            )))
        };

        if self.url.trim().is_empty() {
            return invalid("empty url".to_string());
        }
        if self.layers.is_empty() {
            return invalid("no layer defined".to_string());
        }
        if self.service == ServiceKind::Wmts && self.matrix.is_none() {
            return invalid("WMTS sources need a 'matrix' identifier".to_string());
        }
        if self.service == ServiceKind::Tms {
            let placeholders: &[&str] = if self.quadkey {
                &["{QUADKEY}"]
            } else {
                &["{X}", "{Y}", "{Z}"]
            };
            if let Some(missing) = placeholders.iter().find(|p| !self.url.contains(**p)) {
                return invalid(format!("url template lacks {}", missing));
            }
        }
        for (lay_key, layer) in &self.layers {
            if layer.zmin > layer.zmax {
                return invalid(format!(
                    "layer '{}' has zmin {} above zmax {}",
                    lay_key, layer.zmin, layer.zmax
                ));
            }
            if TileFormat::parse(&layer.format).is_none() {
                return invalid(format!(
                    "layer '{}' has unsupported format '{}'",
                    lay_key, layer.format
                ));
            }
        }
        Ok(())
    }
}

/// Grids and sources known to a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub grids: BTreeMap<String, GridDefinition>,

    #[serde(default)]
    pub sources: BTreeMap<String, SourceDefinition>,
}

impl Catalog {
    /// Grid presets plus the bundled sources.
    pub fn builtin() -> MapResult<Self> {
        let mut catalog = Self {
            grids: grid_presets()?,
            sources: BTreeMap::new(),
        };
        let bundled: Catalog = serde_yaml::from_str(BUILTIN_SOURCES)?;
        catalog.merge(bundled);
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parse a catalog document without the built-in entries.
    ///
    /// Sources may only reference grids of the same document; use
    /// [`Catalog::load`] or [`Catalog::merge`] to build on the presets.
    pub fn from_yaml(yaml: &str) -> MapResult<Self> {
        let catalog: Catalog = serde_yaml::from_str(yaml)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Built-in catalog with the entries of the file at `path` merged over it.
    pub fn load(path: impl AsRef<Path>) -> MapResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let user: Catalog = serde_yaml::from_str(&content)?;
        info!(
            path = %path.display(),
            grids = user.grids.len(),
            sources = user.sources.len(),
            "Loaded catalog file"
        );

        let mut catalog = Self::builtin()?;
        catalog.merge(user);
        catalog.validate()?;
        Ok(catalog)
    }

    /// Add the entries of `other`, replacing those with the same key.
    pub fn merge(&mut self, other: Catalog) {
        for (key, grid) in other.grids {
            if self.grids.insert(key.clone(), grid).is_some() {
                debug!(grid = %key, "Grid definition overridden");
            }
        }
        for (key, source) in other.sources {
            if self.sources.insert(key.clone(), source).is_some() {
                debug!(source = %key, "Source definition overridden");
            }
        }
    }

    pub fn validate(&self) -> MapResult<()> {
        for grid in self.grids.values() {
            grid.validate()?;
        }
        for (key, source) in &self.sources {
            source.validate(key)?;
            if !self.grids.contains_key(&source.grid) {
                return Err(MapError::Configuration(format!(
                    "source '{}' references unknown grid '{}'",
                    key, source.grid
                )));
            }
        }
        Ok(())
    }

    pub fn grid(&self, key: &str) -> MapResult<&GridDefinition> {
        self.grids
            .get(key)
            .ok_or_else(|| MapError::Configuration(format!("unknown grid '{}'", key)))
    }

    pub fn source(&self, key: &str) -> MapResult<&SourceDefinition> {
        self.sources
            .get(key)
            .ok_or_else(|| MapError::Configuration(format!("unknown source '{}'", key)))
    }
}

/// Runtime settings of a [`crate::MapService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Age after which cached tiles are downloaded again.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,

    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Default worker count of tile batches.
    #[serde(default = "default_nb_threads")]
    pub nb_threads: usize,

    #[serde(default = "projection::config::default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub resampling: Resampling,

    #[serde(default)]
    pub projection: ProjectionConfig,
}

fn default_max_age_days() -> i64 {
    storage::DEFAULT_MAX_AGE_DAYS
}

fn default_download_timeout() -> u64 {
    4
}

fn default_nb_threads() -> usize {
    10
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            download_timeout_secs: default_download_timeout(),
            nb_threads: default_nb_threads(),
            user_agent: projection::config::default_user_agent(),
            resampling: Resampling::default(),
            projection: ProjectionConfig::default(),
        }
    }
}
