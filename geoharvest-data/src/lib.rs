//! Harvesting and loading logic for the geoharvest pipeline.
//!
//! Responsibilities:
//! - Speak the paged feature-service protocols and collect raw records.
//! - Normalise raw GeoJSON geometries into canonical form.
//! - Drive full-rebuild and incremental loads into a spatial store.
//!
//! Boundaries:
//! - Geometry, storage and analysis types live in `geoharvest-core`.
//! - Source catalogues are supplied by the caller.
//!
//! Invariants:
//! - One source is harvested at a time and its pages are fetched in order.
//! - Every bulk mutation of the live table ends with an index rebuild.

pub mod harvest;
pub mod loader;
pub mod normalize;
pub mod service;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use harvest::{HarvestError, HttpHarvester, SourceHarvester};
pub use loader::{
    BulkLoader, BulkLoaderConfig, HarvestSummary, LoadError, RunReport, SourceOutcome,
    SourceReport,
};
pub use normalize::{GeometryDecodeError, normalize, normalize_all};
pub use service::{
    ArcGisFetcher, FetchError, FetcherBuildError, HttpFetcherConfig, PagedFetcher,
    RawGeometryRecord, WfsFetcher, fetch_all,
};
