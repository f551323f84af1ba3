//! Tile transport.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use map_common::{MapError, MapResult};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::Client;
use tracing::instrument;

use crate::config::ServiceConfig;

/// Fetches raw tile payloads.
///
/// Implementations must only return bytes that decode as an image; anything
/// else is an error so that nothing unusable reaches the cache.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    async fn fetch(&self, url: &str, referer: &str) -> MapResult<Bytes>;
}

/// HTTP fetcher presenting itself as a web browser.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &ServiceConfig) -> MapResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("image/png,image/*;q=0.8,*/*;q=0.5"),
        );
        headers.insert(
            header::ACCEPT_CHARSET,
            HeaderValue::from_static("ISO-8859-1,utf-8;q=0.7,*;q=0.7"),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("fr,en-us,en;q=0.5"),
        );

        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .pool_max_idle_per_host(config.nb_threads.max(1))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| MapError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl TileFetcher for HttpFetcher {
    #[instrument(skip(self, referer), level = "debug")]
    async fn fetch(&self, url: &str, referer: &str) -> MapResult<Bytes> {
        let mut request = self.client.get(url);
        if !referer.is_empty() {
            request = request.header(header::REFERER, referer);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MapError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MapError::Network(format!("HTTP {}", status)));
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| MapError::Network(e.to_string()))?;
        if !raster::is_image(&data) {
            return Err(MapError::CorruptData(format!(
                "{} bytes that are not an image",
                data.len()
            )));
        }
        Ok(data)
    }
}
