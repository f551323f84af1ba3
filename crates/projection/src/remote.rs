//! EPSG.io web service transformer.
//!
//! The slowest backend: every call is an HTTP round trip. Point lists are
//! packed into `data=x,y;x,y;...` query strings, split so that no URL grows
//! past the configured length.

use std::time::Duration;

use async_trait::async_trait;
use map_common::{Crs, MapError, MapResult};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, error, instrument};

use crate::backend::{EngineKind, Transformer};
use crate::ProjectionConfig;

/// Decimal places kept when packing coordinates into a query string.
const PRECISION: i32 = 4;

/// HTTP client for the EPSG.io `trans` endpoint.
#[derive(Debug, Clone)]
pub struct EpsgIoClient {
    client: Client,
    base_url: String,
    ping_timeout: Duration,
    max_url_len: usize,
}

impl EpsgIoClient {
    pub fn new(config: &ProjectionConfig) -> MapResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.remote_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| MapError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.remote_url.trim_end_matches('/').to_string(),
            ping_timeout: Duration::from_secs(config.remote_ping_timeout_secs),
            max_url_len: config.max_url_len,
        })
    }

    /// Whether the service answers within the ping timeout.
    pub async fn ping(&self) -> bool {
        match self
            .client
            .get(&self.base_url)
            .timeout(self.ping_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                error!(url = %self.base_url, status = %resp.status(), "Cannot ping reprojection web service");
                false
            }
            Err(e) => {
                error!(url = %self.base_url, error = %e, "Cannot ping reprojection web service");
                false
            }
        }
    }

    /// URL for a single point.
    pub fn point_url(&self, src: u32, dst: u32, x: f64, y: f64) -> String {
        format!(
            "{}/trans?x={}&y={}&z=0&s_srs={}&t_srs={}",
            self.base_url, x, y, src, dst
        )
    }

    /// URLs for a point list, each within `max_url_len`.
    pub fn batch_urls(&self, src: u32, dst: u32, points: &[(f64, f64)]) -> Vec<String> {
        let prefix = format!("{}/trans?data=", self.base_url);
        let suffix = format!("&s_srs={}&t_srs={}", src, dst);
        let budget = self.max_url_len.saturating_sub(prefix.len() + suffix.len());

        let mut urls = Vec::new();
        let mut data = String::new();
        for &(x, y) in points {
            let pair = format!("{},{}", round(x), round(y));
            if !data.is_empty() && data.len() + 1 + pair.len() > budget {
                urls.push(format!("{}{}{}", prefix, data, suffix));
                data.clear();
            }
            if !data.is_empty() {
                data.push(';');
            }
            data.push_str(&pair);
        }
        if !data.is_empty() {
            urls.push(format!("{}{}{}", prefix, data, suffix));
        }
        urls
    }

    #[instrument(skip(self), fields(url = %url))]
    async fn fetch_json(&self, url: &str) -> MapResult<Value> {
        debug!("Requesting reprojection");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MapError::Reprojection(format!("request to {} failed: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(MapError::Reprojection(format!(
                "request to {} failed with status {}",
                url,
                resp.status()
            )));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| MapError::Reprojection(format!("invalid response from {}: {}", url, e)))
    }

    pub async fn transform(&self, src: u32, dst: u32, points: &[(f64, f64)]) -> MapResult<Vec<(f64, f64)>> {
        if let [(x, y)] = points {
            let obj = self.fetch_json(&self.point_url(src, dst, *x, *y)).await?;
            return Ok(vec![parse_point(&obj)?]);
        }

        let mut result = Vec::with_capacity(points.len());
        for url in self.batch_urls(src, dst, points) {
            let obj = self.fetch_json(&url).await?;
            let items = obj
                .as_array()
                .ok_or_else(|| MapError::Reprojection("expected a JSON array of points".to_string()))?;
            for item in items {
                result.push(parse_point(item)?);
            }
        }

        if result.len() != points.len() {
            return Err(MapError::Reprojection(format!(
                "expected {} points, service returned {}",
                points.len(),
                result.len()
            )));
        }
        Ok(result)
    }
}

fn round(v: f64) -> f64 {
    let factor = 10f64.powi(PRECISION);
    (v * factor).round() / factor
}

/// The service returns coordinates either as JSON numbers or numeric strings.
fn parse_coord(obj: &Value, key: &str) -> MapResult<f64> {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| MapError::Reprojection(format!("missing or invalid '{}' in response", key)))
}

fn parse_point(obj: &Value) -> MapResult<(f64, f64)> {
    Ok((parse_coord(obj, "x")?, parse_coord(obj, "y")?))
}

/// Transformer delegating to EPSG.io. Only EPSG codes are supported.
#[derive(Debug, Clone)]
pub struct RemoteTransformer {
    client: EpsgIoClient,
    src: u32,
    dst: u32,
}

impl RemoteTransformer {
    /// Returns `None` unless both CRSs are EPSG codes.
    pub fn new(client: EpsgIoClient, src: &Crs, dst: &Crs) -> Option<Self> {
        Some(Self {
            src: src.epsg_code()?,
            dst: dst.epsg_code()?,
            client,
        })
    }
}

#[async_trait]
impl Transformer for RemoteTransformer {
    fn kind(&self) -> EngineKind {
        EngineKind::Remote
    }

    async fn points(&self, points: &[(f64, f64)]) -> MapResult<Vec<(f64, f64)>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }
        self.client.transform(self.src, self.dst, points).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(max_url_len: usize) -> EpsgIoClient {
        let config = ProjectionConfig {
            remote_url: "http://epsg.io/".to_string(),
            max_url_len,
            ..Default::default()
        };
        EpsgIoClient::new(&config).unwrap()
    }

    #[test]
    fn test_point_url() {
        assert_eq!(
            client(4000).point_url(4326, 3857, 2.5, 48.0),
            "http://epsg.io/trans?x=2.5&y=48&z=0&s_srs=4326&t_srs=3857"
        );
    }

    #[test]
    fn test_batch_rounds_to_four_decimals() {
        let urls = client(4000).batch_urls(3857, 4326, &[(1.234567, 2.0), (3.0, -4.55555)]);
        assert_eq!(
            urls,
            vec!["http://epsg.io/trans?data=1.2346,2;3,-4.5556&s_srs=3857&t_srs=4326".to_string()]
        );
    }

    #[test]
    fn test_batch_respects_url_budget() {
        let points: Vec<(f64, f64)> = (0..2000)
            .map(|i| (1_000_000.0 + i as f64 * 0.1234, -2_000_000.0 - i as f64))
            .collect();
        let c = client(4000);
        let urls = c.batch_urls(3857, 4326, &points);
        assert!(urls.len() > 1);
        assert!(urls.iter().all(|u| u.len() <= 4000));

        let total: usize = urls
            .iter()
            .map(|u| {
                let data = u.split("data=").nth(1).unwrap().split('&').next().unwrap();
                data.split(';').count()
            })
            .sum();
        assert_eq!(total, points.len());
    }

    #[test]
    fn test_parse_point_accepts_strings_and_numbers() {
        let v: Value = serde_json::json!({"x": "1.5", "y": 2.25});
        assert_eq!(parse_point(&v).unwrap(), (1.5, 2.25));
        let bad: Value = serde_json::json!({"x": "abc", "y": 1});
        assert!(matches!(parse_point(&bad), Err(MapError::Reprojection(_))));
    }

    #[test]
    fn test_remote_requires_epsg_codes() {
        let c = client(4000);
        assert!(RemoteTransformer::new(c.clone(), &Crs::epsg(2154), &Crs::wgs84()).is_some());
        let proj = Crs::parse("+proj=longlat +datum=WGS84").unwrap();
        assert!(RemoteTransformer::new(c, &proj, &Crs::wgs84()).is_none());
    }
}
