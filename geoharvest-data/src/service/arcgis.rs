//! ArcGIS REST map and feature services.
//!
//! The layer is looked up by name in the service's `layers` listing, then
//! queried with `resultOffset` paging. The service caps each page at its own
//! maximum record count and sets `exceededTransferLimit` while more records
//! remain.

use async_trait::async_trait;
use geoharvest_core::Source;
use log::debug;
use url::Url;

use super::http::{Fetched, HttpClient, log_failing_body, page_records};
use super::wire::{FeaturePage, LayersResponse, describe_error};
use super::{FetchError, FetcherBuildError, HttpFetcherConfig, Page, PagedFetcher, ResolvedLayer};

const SERVICE_SEGMENTS: [&str; 2] = ["MapServer", "FeatureServer"];

/// Filter sent when a source declares none.
const MATCH_ALL: &str = "1=1";

/// Fetcher for ArcGIS REST layers.
#[derive(Debug, Clone)]
pub struct ArcGisFetcher {
    http: HttpClient,
}

impl ArcGisFetcher {
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
        })
    }

    async fn layer_id(&self, root: &Url, layer: &str) -> Result<i64, FetchError> {
        let url = child(root, &["layers"])?;
        let Fetched {
            value,
            body,
            url: request_url,
        } = self
            .http
            .get_json::<LayersResponse>(
                &url,
                &[("dynamicLayers", MATCH_ALL.to_owned()), ("f", "json".to_owned())],
            )
            .await?;
        if let Some(error) = value.error.as_ref() {
            log_failing_body(&request_url, &body);
            let (code, message) = describe_error(error);
            return Err(FetchError::Service {
                url: request_url,
                code,
                message,
            });
        }
        if let Some(found) = value.layers.iter().find(|info| info.name == layer) {
            return Ok(found.id);
        }
        match value.layers.as_slice() {
            [only] => {
                debug!(
                    "layer {layer:?} not listed at {request_url}; using sole layer {:?}",
                    only.name
                );
                Ok(only.id)
            }
            layers => Err(FetchError::LayerNotFound {
                url: request_url,
                layer: layer.to_owned(),
                available: layers.iter().map(|info| info.name.clone()).collect(),
            }),
        }
    }
}

#[async_trait]
impl PagedFetcher for ArcGisFetcher {
    async fn resolve(&self, source: &Source) -> Result<ResolvedLayer, FetchError> {
        let root = service_root(&source.url)?;
        let id = self.layer_id(&root, &source.layer).await?;
        let endpoint = child(&root, &[id.to_string().as_str(), "query"])?;
        debug!("source {} resolved to {endpoint}", source.id);
        Ok(ResolvedLayer {
            source_id: source.id,
            endpoint,
            layer: source.layer.clone(),
            filter: source.filter.clone(),
        })
    }

    async fn fetch_page(&self, layer: &ResolvedLayer, offset: u64) -> Result<Page, FetchError> {
        let query = [
            (
                "where",
                layer.filter.as_deref().unwrap_or(MATCH_ALL).to_owned(),
            ),
            ("outFields", "*".to_owned()),
            ("f", "geojson".to_owned()),
            ("resultOffset", offset.to_string()),
        ];
        let fetched = self
            .http
            .get_json::<FeaturePage>(&layer.endpoint, &query)
            .await?;
        let (records, page) = page_records(fetched)?;
        Ok(Page {
            records,
            has_more: page.exceeded_transfer_limit(),
        })
    }
}

/// Service root of an ArcGIS URL: the path up to and including the
/// `MapServer` or `FeatureServer` segment, without query or fragment.
fn service_root(raw: &str) -> Result<Url, FetchError> {
    let invalid = |message: &str| FetchError::InvalidUrl {
        url: raw.to_owned(),
        message: message.to_owned(),
    };
    let mut url = Url::parse(raw).map_err(|err| invalid(&err.to_string()))?;
    let segments: Vec<String> = url
        .path_segments()
        .ok_or_else(|| invalid("URL cannot carry a path"))?
        .map(str::to_owned)
        .collect();
    let root = segments
        .iter()
        .position(|segment| SERVICE_SEGMENTS.contains(&segment.as_str()))
        .and_then(|end| segments.get(..=end))
        .ok_or_else(|| invalid("no MapServer or FeatureServer segment"))?;
    url.set_path(&format!("/{}", root.join("/")));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn child(base: &Url, segments: &[&str]) -> Result<Url, FetchError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| FetchError::InvalidUrl {
            url: base.to_string(),
            message: "URL cannot carry a path".to_owned(),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
