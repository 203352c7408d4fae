//! Paged feature services.
//!
//! External layers are served over one of two pagination protocols. Each
//! protocol is a [`PagedFetcher`]: it resolves the per-layer endpoint once
//! and then fetches one page at a time. The shared [`fetch_all`] loop owns
//! the offset cursor and the termination rule, so no protocol branching
//! happens outside the fetchers themselves.
//!
//! # Example
//!
//! ```no_run
//! use geoharvest_core::{Source, SourceId};
//! use geoharvest_data::service::{ArcGisFetcher, HttpFetcherConfig, fetch_all};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HttpFetcherConfig::default().with_page_size(2000);
//! let fetcher = ArcGisFetcher::with_config(config)?;
//! let source = Source::new(
//!     SourceId(1),
//!     "https://maps.example.org/arcgis/rest/services/Parks/MapServer",
//!     "Green spaces",
//! )?;
//! let records = fetch_all(&fetcher, &source).await?;
//! println!("fetched {} records", records.len());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use geoharvest_core::{Source, SourceId};
use log::{debug, info};
use thiserror::Error;
use url::Url;

mod arcgis;
mod http;
mod wfs;
mod wire;

pub use arcgis::ArcGisFetcher;
pub use wfs::WfsFetcher;
pub use wire::RawGeometryRecord;

/// Default user agent for service requests.
pub const DEFAULT_USER_AGENT: &str = "geoharvest/0.1";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default number of features requested per next-link page.
pub const DEFAULT_PAGE_SIZE: u32 = 5000;

/// Failure of a single fetch; aborts the harvest of the current source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The request did not complete within the configured timeout.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout {
        /// Requested URL.
        url: String,
        /// Timeout that elapsed.
        timeout_secs: u64,
    },
    /// The service answered with a non-success status.
    #[error("request to {url} failed with HTTP {status}: {message}")]
    Http {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body excerpt.
        message: String,
    },
    /// The connection failed.
    #[error("network error requesting {url}: {message}")]
    Network {
        /// Requested URL.
        url: String,
        /// Transport diagnostic.
        message: String,
    },
    /// The response body was not the expected JSON document.
    #[error("response from {url} is not valid JSON: {message}")]
    NotJson {
        /// Requested URL.
        url: String,
        /// Decoder diagnostic.
        message: String,
    },
    /// The response declared an error.
    #[error("service at {url} reported an error{}: {message}", code_suffix(.code))]
    Service {
        /// Requested URL.
        url: String,
        /// Service error code, when provided.
        code: Option<i64>,
        /// Service error message.
        message: String,
    },
    /// The response had no `features` member.
    #[error("response from {url} has no features member")]
    MissingFeatures {
        /// Requested URL.
        url: String,
    },
    /// A page contained no features.
    #[error("page at offset {offset} from {url} contained no features")]
    EmptyPage {
        /// Endpoint queried.
        url: String,
        /// Offset of the empty page.
        offset: u64,
    },
    /// No layer matched the configured name.
    #[error("layer {layer:?} not found at {url}; available layers: {available:?}")]
    LayerNotFound {
        /// Layer listing URL.
        url: String,
        /// Configured layer name.
        layer: String,
        /// Names offered by the service.
        available: Vec<String>,
    },
    /// The source URL could not be used.
    #[error("invalid service URL {url}: {message}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parser diagnostic.
        message: String,
    },
}

fn code_suffix(code: &Option<i64>) -> String {
    code.map(|code| format!(" {code}")).unwrap_or_default()
}

/// Error raised when building a fetcher.
#[derive(Debug, Error)]
pub enum FetcherBuildError {
    /// Failed to build the HTTP client.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Configuration shared by the HTTP fetchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFetcherConfig {
    /// Timeout applied to every page request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Features requested per page where the protocol takes a page size.
    pub page_size: u32,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl HttpFetcherConfig {
    /// Set the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the user agent string.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}

/// A layer whose query endpoint has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLayer {
    /// Owning source.
    pub source_id: SourceId,
    /// Endpoint pages are requested from.
    pub endpoint: Url,
    /// Layer name sent with each request, where the protocol needs one.
    pub layer: String,
    /// Query filter sent with each request, where the protocol takes one.
    pub filter: Option<String>,
}

/// One page of raw records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    /// Records in service order.
    pub records: Vec<RawGeometryRecord>,
    /// Whether the service signalled that more pages follow.
    pub has_more: bool,
}

/// A pagination protocol.
#[async_trait]
pub trait PagedFetcher: Send + Sync {
    /// Resolve the endpoint pages are requested from.
    async fn resolve(&self, source: &Source) -> Result<ResolvedLayer, FetchError>;

    /// Fetch the page starting at `offset` records.
    async fn fetch_page(&self, layer: &ResolvedLayer, offset: u64) -> Result<Page, FetchError>;
}

/// Fetch every record of `source`, page by page.
///
/// The offset starts at zero and advances by the number of records each
/// page returned. Fetching stops after the first page that does not signal
/// more. A page with no records is a failure, as is any page-level error;
/// nothing fetched before the failure is returned.
pub async fn fetch_all<F>(
    fetcher: &F,
    source: &Source,
) -> Result<Vec<RawGeometryRecord>, FetchError>
where
    F: PagedFetcher + ?Sized,
{
    let layer = fetcher.resolve(source).await?;
    info!("fetching source {} from {}", source.id, layer.endpoint);
    let mut records = Vec::new();
    let mut offset = 0_u64;
    loop {
        let page = fetcher.fetch_page(&layer, offset).await?;
        if page.records.is_empty() {
            return Err(FetchError::EmptyPage {
                url: layer.endpoint.to_string(),
                offset,
            });
        }
        let returned = page.records.len();
        debug!(
            "source {} page at offset {offset} returned {returned} records (more: {})",
            source.id, page.has_more
        );
        offset += returned as u64;
        records.extend(page.records);
        if !page.has_more {
            break;
        }
    }
    info!("fetched {} records for source {}", records.len(), source.id);
    Ok(records)
}
