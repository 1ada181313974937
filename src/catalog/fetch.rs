use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{parse_catalog, EndpointRecord};
use crate::error::{AppError, Result};

/// Per-mirror request budget.
const MIRROR_TIMEOUT: Duration = Duration::from_secs(15);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Where fresh endpoint lists come from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<EndpointRecord>>;
}

/// Fetches the CSV feed over HTTP, trying each mirror in turn.
pub struct HttpCatalogSource {
    client: Client,
    urls: Vec<String>,
}

impl HttpCatalogSource {
    pub fn new(urls: Vec<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(MIRROR_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, urls })
    }

    async fn download(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::network_with_url(url, e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AppError::network_with_url(url, resp.status().to_string()));
        }

        resp.text()
            .await
            .map_err(|e| AppError::network_with_url(url, e.to_string()))
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch(&self) -> Result<Vec<EndpointRecord>> {
        let mut last_error = None;

        for url in &self.urls {
            log::info!("Fetching endpoint catalog from {}", url);
            match self.download(url).await {
                Ok(body) => {
                    let endpoints = parse_catalog(&body);
                    if endpoints.is_empty() {
                        log::warn!("Catalog from {} contained no usable endpoints", url);
                        last_error = Some(AppError::catalog(format!("no endpoints at {url}")));
                        continue;
                    }
                    log::info!("Fetched {} endpoints from {}", endpoints.len(), url);
                    return Ok(endpoints);
                }
                Err(e) => {
                    log::warn!("Catalog mirror {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::catalog("no catalog mirrors configured")))
    }
}

/// Serves a fixed list, or a sequence of lists on successive fetches.
///
/// Used for offline catalogs read from disk and in tests.
pub struct StaticCatalogSource {
    batches: Mutex<Vec<Vec<EndpointRecord>>>,
    fetches: AtomicUsize,
}

impl StaticCatalogSource {
    pub fn new(endpoints: Vec<EndpointRecord>) -> Self {
        Self::with_batches(vec![endpoints])
    }

    /// Each fetch pops the next batch; the last batch repeats forever.
    pub fn with_batches(batches: Vec<Vec<EndpointRecord>>) -> Self {
        Self {
            batches: Mutex::new(batches),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn from_feed(data: &str) -> Self {
        Self::new(parse_catalog(data))
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    async fn fetch(&self) -> Result<Vec<EndpointRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
        let batch = if batches.len() > 1 {
            batches.remove(0)
        } else {
            batches.first().cloned().unwrap_or_default()
        };
        drop(batches);
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::endpoint;

    #[tokio::test]
    async fn test_static_source_walks_batches() {
        let source = StaticCatalogSource::with_batches(vec![
            vec![endpoint("a", "JP", 1.0)],
            vec![endpoint("b", "JP", 1.0), endpoint("c", "JP", 1.0)],
        ]);
        assert_eq!(source.fetch().await.unwrap().len(), 1);
        assert_eq!(source.fetch().await.unwrap().len(), 2);
        assert_eq!(source.fetch().await.unwrap().len(), 2);
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_http_source_without_mirrors_fails() {
        let source = HttpCatalogSource::new(Vec::new()).unwrap();
        let err = source.fetch().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Catalog);
    }
}
