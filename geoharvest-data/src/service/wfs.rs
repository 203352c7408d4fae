//! OGC WFS 2.0 services.
//!
//! Pages are requested with `startIndex` and `count`. A GeoJSON response
//! carrying a `next` link signals that more features remain; the link
//! target is not followed, the offset is advanced instead. Source filters
//! are not forwarded.

use async_trait::async_trait;
use geoharvest_core::Source;
use url::Url;

use super::http::{HttpClient, page_records};
use super::wire::FeaturePage;
use super::{FetchError, FetcherBuildError, HttpFetcherConfig, Page, PagedFetcher, ResolvedLayer};

/// Fetcher for WFS feature types.
#[derive(Debug, Clone)]
pub struct WfsFetcher {
    http: HttpClient,
    page_size: u32,
}

impl WfsFetcher {
    /// Create a fetcher with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new() -> Result<Self, FetcherBuildError> {
        Self::with_config(HttpFetcherConfig::default())
    }

    /// Create a fetcher with explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn with_config(config: HttpFetcherConfig) -> Result<Self, FetcherBuildError> {
        Ok(Self {
            http: HttpClient::new(&config)?,
            page_size: config.page_size,
        })
    }
}

#[async_trait]
impl PagedFetcher for WfsFetcher {
    async fn resolve(&self, source: &Source) -> Result<ResolvedLayer, FetchError> {
        let endpoint = Url::parse(&source.url).map_err(|err| FetchError::InvalidUrl {
            url: source.url.clone(),
            message: err.to_string(),
        })?;
        Ok(ResolvedLayer {
            source_id: source.id,
            endpoint,
            layer: source.layer.clone(),
            filter: source.filter.clone(),
        })
    }

    async fn fetch_page(&self, layer: &ResolvedLayer, offset: u64) -> Result<Page, FetchError> {
        let query = [
            ("service", "WFS".to_owned()),
            ("version", "2.0.0".to_owned()),
            ("request", "GetFeature".to_owned()),
            ("typeNames", layer.layer.clone()),
            ("outputFormat", "application/json".to_owned()),
            ("count", self.page_size.to_string()),
            ("startIndex", offset.to_string()),
        ];
        let fetched = self
            .http
            .get_json::<FeaturePage>(&layer.endpoint, &query)
            .await?;
        let (records, page) = page_records(fetched)?;
        Ok(Page {
            records,
            has_more: page.has_next_link(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoharvest_core::SourceId;
    use rstest::rstest;

    #[rstest]
    #[tokio::test]
    async fn resolves_to_source_url() {
        let fetcher = WfsFetcher::new().expect("fetcher");
        let source = Source::new(
            SourceId(4),
            "https://geo.example.org/geoserver/wfs",
            "parks:trees",
        )
        .expect("source")
        .with_filter("height > 10");

        let layer = fetcher.resolve(&source).await.expect("resolve");

        assert_eq!(layer.endpoint.as_str(), "https://geo.example.org/geoserver/wfs");
        assert_eq!(layer.layer, "parks:trees");
        assert_eq!(layer.filter.as_deref(), Some("height > 10"));
    }

    #[rstest]
    #[tokio::test]
    async fn rejects_unparseable_url() {
        let fetcher = WfsFetcher::new().expect("fetcher");
        let source = Source::new(SourceId(5), "geoserver wfs", "trees").expect("source");
        let err = fetcher.resolve(&source).await.expect_err("invalid url");
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }
}
