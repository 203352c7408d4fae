//! Harvesting one source end to end: fetch every page, then normalise.

use async_trait::async_trait;
use geoharvest_core::{CanonicalGeometry, ProtocolKind, Source};
use log::info;
use thiserror::Error;

use crate::normalize::{GeometryDecodeError, normalize_all};
use crate::service::{
    ArcGisFetcher, FetchError, FetcherBuildError, HttpFetcherConfig, WfsFetcher, fetch_all,
};

/// Failure of one source's harvest.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HarvestError {
    /// A page request failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// A geometry could not be decoded.
    #[error(transparent)]
    Geometry(#[from] GeometryDecodeError),
}

/// Produces the canonical geometries of a source.
#[async_trait]
pub trait SourceHarvester: Send + Sync {
    /// Harvest every feature of `source`.
    ///
    /// Either every page is fetched and decoded, or the harvest fails as a
    /// whole.
    async fn harvest(&self, source: &Source) -> Result<Vec<CanonicalGeometry>, HarvestError>;
}

/// Harvester speaking both service protocols over HTTP.
///
/// The protocol is chosen once per source from the shape of its URL.
#[derive(Debug, Clone)]
pub struct HttpHarvester {
    arcgis: ArcGisFetcher,
    wfs: WfsFetcher,
}

impl HttpHarvester {
    /// Create a harvester sharing `config` across both protocols.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client fails to build.
    pub fn new(config: HttpFetcherConfig) -> Result<Self, FetcherBuildError> {
        Ok(Self {
            arcgis: ArcGisFetcher::with_config(config.clone())?,
            wfs: WfsFetcher::with_config(config)?,
        })
    }
}

#[async_trait]
impl SourceHarvester for HttpHarvester {
    async fn harvest(&self, source: &Source) -> Result<Vec<CanonicalGeometry>, HarvestError> {
        let protocol = source.protocol();
        info!("harvesting source {} ({protocol:?})", source.id);
        let records = match protocol {
            ProtocolKind::ArcGisRest => fetch_all(&self.arcgis, source).await?,
            ProtocolKind::Wfs => fetch_all(&self.wfs, source).await?,
        };
        let geometries = normalize_all(&records)?;
        info!(
            "source {} yielded {} geometries from {} records",
            source.id,
            geometries.len(),
            records.len()
        );
        Ok(geometries)
    }
}
