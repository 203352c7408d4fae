//! Core domain types for the geoharvest pipeline.
//!
//! These models describe the external layers that get harvested, the
//! canonical geometry form every harvested feature is normalised into, and
//! the analyses (proximity clustering and coverage) that run over a source's
//! geometry set. Constructors return `Result` to surface invalid input early.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use geo::Rect;
use thiserror::Error;

pub mod cluster;
pub mod coverage;
pub mod geometry;
pub mod projection;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use cluster::{ClusterError, ClusterGroup, cluster};
pub use coverage::{coverage, coverage_within};
pub use geometry::{CanonicalGeometry, GeometryError, GeometryKind};
pub use projection::{LambertAzimuthalEqualArea, Planar, Projection, ProjectionError};
pub use store::{IndexState, MergeSummary, SpatialIndexGuard, SpatialStore};

#[cfg(feature = "store-sqlite")]
pub use store::{SqliteFeatureStore, SqliteFeatureStoreError};

/// Stable identifier of a [`Source`] in the external catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SourceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Pagination protocol spoken by a source's endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ProtocolKind {
    /// ArcGIS REST map/feature service: `resultOffset` paging terminated by
    /// the absence of `exceededTransferLimit`.
    ArcGisRest,
    /// OGC WFS 2.0: `startIndex` paging terminated by the absence of a
    /// `next` link.
    Wfs,
}

impl ProtocolKind {
    /// Infer the protocol from the shape of an endpoint URL.
    ///
    /// ArcGIS REST services live under `/rest/services/` and expose a
    /// `MapServer` or `FeatureServer` path segment; anything else is
    /// treated as a WFS endpoint.
    ///
    /// # Examples
    ///
    /// ```
    /// use geoharvest_core::ProtocolKind;
    ///
    /// assert_eq!(
    ///     ProtocolKind::detect("https://maps.example.org/arcgis/rest/services/Parks/MapServer"),
    ///     ProtocolKind::ArcGisRest,
    /// );
    /// assert_eq!(
    ///     ProtocolKind::detect("https://geo.example.org/geoserver/wfs"),
    ///     ProtocolKind::Wfs,
    /// );
    /// ```
    #[must_use]
    pub fn detect(url: &str) -> Self {
        let path = url
            .split_once("://")
            .map_or(url, |(_, rest)| rest)
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let under_services = path.to_ascii_lowercase().contains("/rest/services/");
        let service_segment = path
            .split('/')
            .any(|segment| segment == "MapServer" || segment == "FeatureServer");
        if under_services && service_segment {
            Self::ArcGisRest
        } else {
            Self::Wfs
        }
    }
}

/// An external layer configured for harvesting.
///
/// Sources are owned by the catalogue and remain immutable for the duration
/// of a run.
///
/// # Examples
///
/// ```
/// use geoharvest_core::{ProtocolKind, Source, SourceId};
///
/// # fn main() -> Result<(), geoharvest_core::SourceError> {
/// let source = Source::new(
///     SourceId(7),
///     "https://geo.example.org/geoserver/wfs",
///     "parks:green_spaces",
/// )?;
/// assert_eq!(source.protocol(), ProtocolKind::Wfs);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Source {
    /// Catalogue identifier.
    pub id: SourceId,
    /// Endpoint URL the layer is served from.
    pub url: String,
    /// Layer name (ArcGIS layer name or WFS type name).
    pub layer: String,
    /// Optional query filter forwarded to services that accept one.
    #[cfg_attr(feature = "serde", serde(default))]
    pub filter: Option<String>,
    /// Declared bounding box in WGS84 (`x = longitude`, `y = latitude`).
    #[cfg_attr(feature = "serde", serde(default))]
    pub bbox: Option<Rect<f64>>,
}

/// Errors returned by [`Source::new`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The endpoint URL was blank.
    #[error("source {id} has an empty endpoint URL")]
    EmptyUrl {
        /// Identifier of the rejected source.
        id: SourceId,
    },
    /// The layer name was blank.
    #[error("source {id} has an empty layer name")]
    EmptyLayer {
        /// Identifier of the rejected source.
        id: SourceId,
    },
}

impl Source {
    /// Validates and constructs a [`Source`] without filter or bounding box.
    pub fn new(
        id: SourceId,
        url: impl Into<String>,
        layer: impl Into<String>,
    ) -> Result<Self, SourceError> {
        let url = url.into();
        let layer = layer.into();
        if url.trim().is_empty() {
            return Err(SourceError::EmptyUrl { id });
        }
        if layer.trim().is_empty() {
            return Err(SourceError::EmptyLayer { id });
        }
        Ok(Self {
            id,
            url,
            layer,
            filter: None,
            bbox: None,
        })
    }

    /// Attach a query filter.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Attach the declared bounding box.
    #[must_use]
    pub fn with_bbox(mut self, bbox: Rect<f64>) -> Self {
        self.bbox = Some(bbox);
        self
    }

    /// Protocol inferred from the endpoint URL.
    #[must_use]
    pub fn protocol(&self) -> ProtocolKind {
        ProtocolKind::detect(&self.url)
    }
}

/// A persisted feature: a canonical geometry owned by one source.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Owning source.
    pub source_id: SourceId,
    /// Normalised geometry.
    pub geometry: CanonicalGeometry,
}

/// Record of a failed harvest attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HarvestErrorLogEntry {
    /// Source whose harvest failed.
    pub source_id: SourceId,
    /// Human-readable failure description.
    pub message: String,
    /// Seconds since the Unix epoch.
    pub logged_at: i64,
}

impl HarvestErrorLogEntry {
    /// Build an entry stamped with the current wall-clock time.
    pub fn now(source_id: SourceId, message: impl Into<String>) -> Self {
        Self {
            source_id,
            message: message.into(),
            logged_at: unix_now(),
        }
    }
}

/// Current time in whole seconds since the Unix epoch.
///
/// Clocks set before the epoch report zero.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|elapsed| i64::try_from(elapsed.as_secs()).ok())
        .unwrap_or_default()
}
