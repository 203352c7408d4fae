//! Facade crate for the geoharvest feature-layer harvester.
//!
//! This crate re-exports the core domain types and exposes the SQLite store
//! and the HTTP harvesting pipeline behind feature flags.

#![forbid(unsafe_code)]

pub use geoharvest_core::{
    CanonicalGeometry, ClusterError, ClusterGroup, Feature, GeometryError, GeometryKind,
    HarvestErrorLogEntry, IndexState, LambertAzimuthalEqualArea, MergeSummary, Planar, Projection,
    ProjectionError, ProtocolKind, Source, SourceError, SourceId, SpatialIndexGuard, SpatialStore,
    cluster, coverage, coverage_within,
};

#[cfg(feature = "store-sqlite")]
pub use geoharvest_core::{SqliteFeatureStore, SqliteFeatureStoreError};

#[cfg(feature = "http")]
pub use geoharvest_data::{
    BulkLoader, BulkLoaderConfig, FetchError, HarvestError, HarvestSummary, HttpFetcherConfig,
    HttpHarvester, LoadError, RunReport, SourceHarvester, SourceOutcome, SourceReport,
};
