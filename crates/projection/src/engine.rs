//! Backend selection and the `Reproj` handle used by callers.
//!
//! Selection runs once when a `Reproj` is built. `Auto` walks
//! [`EngineKind::RANKED`] and keeps the first backend that can serve the pair;
//! a forced engine either serves the pair or fails with a configuration error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use map_common::{BoundingBox, Crs, MapError, MapResult};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::backend::{EngineKind, Transformer};
use crate::builtin::BuiltinTransformer;
use crate::remote::{EpsgIoClient, RemoteTransformer};
use crate::ProjectionConfig;

/// Remote service client plus a memoized reachability check.
#[derive(Debug)]
struct RemoteProbe {
    client: EpsgIoClient,
    reachable: OnceCell<bool>,
}

impl RemoteProbe {
    fn new(config: &ProjectionConfig) -> MapResult<Self> {
        Ok(Self {
            client: EpsgIoClient::new(config)?,
            reachable: OnceCell::new(),
        })
    }

    async fn is_reachable(&self) -> bool {
        *self.reachable.get_or_init(|| self.client.ping()).await
    }
}

/// A transformation between two fixed CRSs with its backend already chosen.
#[derive(Clone)]
pub struct Reproj {
    src: Crs,
    dst: Crs,
    /// `None` when both CRSs are equal.
    backend: Option<Arc<dyn Transformer>>,
}

impl std::fmt::Debug for Reproj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reproj")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("engine", &self.engine())
            .finish()
    }
}

impl Reproj {
    /// Select a backend for `src -> dst` according to `config`.
    pub async fn new(src: &Crs, dst: &Crs, config: &ProjectionConfig) -> MapResult<Self> {
        if src == dst {
            return Ok(Self::identity(src.clone()));
        }
        let probe = RemoteProbe::new(config)?;
        Self::select(src, dst, config, &probe).await
    }

    /// Identity transformation.
    pub fn identity(crs: Crs) -> Self {
        Self {
            src: crs.clone(),
            dst: crs,
            backend: None,
        }
    }

    /// Wrap an already built backend.
    pub fn with_backend(src: Crs, dst: Crs, backend: Arc<dyn Transformer>) -> Self {
        Self {
            src,
            dst,
            backend: Some(backend),
        }
    }

    async fn select(
        src: &Crs,
        dst: &Crs,
        config: &ProjectionConfig,
        probe: &RemoteProbe,
    ) -> MapResult<Self> {
        let candidates: &[EngineKind] = match config.engine {
            EngineKind::Auto => &EngineKind::RANKED,
            EngineKind::Proj4 => &[EngineKind::Proj4],
            EngineKind::Builtin => &[EngineKind::Builtin],
            EngineKind::Remote => &[EngineKind::Remote],
        };

        for &kind in candidates {
            match build_backend(kind, src, dst, config, probe).await {
                Some(backend) => {
                    info!(src = %src, dst = %dst, engine = %kind, "Selected reprojection engine");
                    return Ok(Self::with_backend(src.clone(), dst.clone(), backend));
                }
                None => debug!(src = %src, dst = %dst, engine = %kind, "Engine cannot serve CRS pair"),
            }
        }

        if config.engine == EngineKind::Auto {
            Err(MapError::Configuration(format!(
                "no reprojection engine can transform {} to {}",
                src, dst
            )))
        } else {
            Err(MapError::Configuration(format!(
                "reprojection engine '{}' cannot transform {} to {}",
                config.engine, src, dst
            )))
        }
    }

    pub fn src(&self) -> &Crs {
        &self.src
    }

    pub fn dst(&self) -> &Crs {
        &self.dst
    }

    /// Selected backend, `None` for an identity transformation.
    pub fn engine(&self) -> Option<EngineKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    pub fn is_identity(&self) -> bool {
        self.backend.is_none()
    }

    pub async fn points(&self, points: &[(f64, f64)]) -> MapResult<Vec<(f64, f64)>> {
        match &self.backend {
            None => Ok(points.to_vec()),
            Some(_) if points.is_empty() => Ok(Vec::new()),
            Some(backend) => backend.points(points).await,
        }
    }

    pub async fn point(&self, x: f64, y: f64) -> MapResult<(f64, f64)> {
        match &self.backend {
            None => Ok((x, y)),
            Some(backend) => backend.point(x, y).await,
        }
    }

    pub async fn bbox(&self, bbox: &BoundingBox) -> MapResult<BoundingBox> {
        match &self.backend {
            None => Ok(*bbox),
            Some(backend) => backend.bbox(bbox).await,
        }
    }
}

async fn build_backend(
    kind: EngineKind,
    src: &Crs,
    dst: &Crs,
    config: &ProjectionConfig,
    probe: &RemoteProbe,
) -> Option<Arc<dyn Transformer>> {
    match kind {
        EngineKind::Auto => None,
        EngineKind::Proj4 => build_proj4(src, dst, config),
        EngineKind::Builtin => {
            BuiltinTransformer::new(src, dst).map(|t| Arc::new(t) as Arc<dyn Transformer>)
        }
        EngineKind::Remote => {
            if !config.enable_remote || !src.is_epsg() || !dst.is_epsg() {
                return None;
            }
            if !probe.is_reachable().await {
                return None;
            }
            RemoteTransformer::new(probe.client.clone(), src, dst)
                .map(|t| Arc::new(t) as Arc<dyn Transformer>)
        }
    }
}

#[cfg(feature = "proj4")]
fn build_proj4(src: &Crs, dst: &Crs, config: &ProjectionConfig) -> Option<Arc<dyn Transformer>> {
    if !config.enable_proj4 {
        return None;
    }
    crate::proj4::Proj4Transformer::new(src, dst).map(|t| Arc::new(t) as Arc<dyn Transformer>)
}

#[cfg(not(feature = "proj4"))]
fn build_proj4(_src: &Crs, _dst: &Crs, _config: &ProjectionConfig) -> Option<Arc<dyn Transformer>> {
    None
}

/// Factory caching one `Reproj` per CRS pair for the lifetime of a service.
#[derive(Debug)]
pub struct ReprojEngine {
    config: ProjectionConfig,
    probe: RemoteProbe,
    cache: Mutex<HashMap<(Crs, Crs), Arc<Reproj>>>,
}

impl ReprojEngine {
    pub fn new(config: ProjectionConfig) -> MapResult<Self> {
        Ok(Self {
            probe: RemoteProbe::new(&config)?,
            config,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    /// Reproj for `src -> dst`, selecting its backend on first use.
    pub async fn get(&self, src: &Crs, dst: &Crs) -> MapResult<Arc<Reproj>> {
        let key = (src.clone(), dst.clone());
        if let Some(reproj) = self.lock_cache()?.get(&key) {
            return Ok(reproj.clone());
        }

        let reproj = if src == dst {
            Arc::new(Reproj::identity(src.clone()))
        } else {
            Arc::new(Reproj::select(src, dst, &self.config, &self.probe).await?)
        };

        Ok(self.lock_cache()?.entry(key).or_insert(reproj).clone())
    }

    fn lock_cache(&self) -> MapResult<std::sync::MutexGuard<'_, HashMap<(Crs, Crs), Arc<Reproj>>>> {
        self.cache
            .lock()
            .map_err(|_| MapError::Configuration("reprojection cache lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_crs_is_identity() {
        let reproj = Reproj::new(&Crs::wgs84(), &Crs::wgs84(), &ProjectionConfig::default())
            .await
            .unwrap();
        assert!(reproj.is_identity());
        assert_eq!(reproj.engine(), None);
        assert_eq!(reproj.point(1.0, 2.0).await.unwrap(), (1.0, 2.0));
    }

    #[tokio::test]
    async fn test_builtin_when_proj4_disabled() {
        let config = ProjectionConfig::builtin_only();
        let reproj = Reproj::new(&Crs::web_mercator(), &Crs::wgs84(), &config)
            .await
            .unwrap();
        assert_eq!(reproj.engine(), Some(EngineKind::Builtin));
    }

    #[tokio::test]
    async fn test_unsupported_pair_is_configuration_error() {
        let config = ProjectionConfig::builtin_only();
        let err = Reproj::new(&Crs::epsg(2154), &Crs::wgs84(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_forced_builtin_rejects_other_pairs() {
        let config = ProjectionConfig {
            engine: EngineKind::Builtin,
            ..Default::default()
        };
        let err = Reproj::new(&Crs::web_mercator(), &Crs::epsg(32631), &config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("builtin"));
    }

    #[tokio::test]
    async fn test_engine_caches_per_pair() {
        let engine = ReprojEngine::new(ProjectionConfig::builtin_only()).unwrap();
        let a = engine.get(&Crs::web_mercator(), &Crs::wgs84()).await.unwrap();
        let b = engine.get(&Crs::web_mercator(), &Crs::wgs84()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = engine.get(&Crs::wgs84(), &Crs::web_mercator()).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
