//! Persistent spatial store for harvested features.
//!
//! The [`SpatialStore`] trait describes the live feature table, the staging
//! area used by incremental refreshes, the spatial index state machine and
//! the harvest error log. Bulk loaders hold the store by `&mut` for the whole
//! window in which the index is disabled, so no other writer on the same
//! handle can observe it. The SQLite store additionally keeps the
//! window in one exclusive transaction, which shuts out other connections.

use std::collections::BTreeMap;

use geo::Rect;

use crate::{CanonicalGeometry, Feature, HarvestErrorLogEntry, SourceId};

mod spatial_index;
#[cfg(feature = "store-sqlite")]
mod schema;
#[cfg(feature = "store-sqlite")]
mod sqlite;

pub use spatial_index::SpatialIndexGuard;
#[cfg(feature = "store-sqlite")]
pub use schema::SCHEMA_VERSION;
#[cfg(feature = "store-sqlite")]
pub use sqlite::{SqliteFeatureStore, SqliteFeatureStoreError};

/// Spatial reference identifier assigned to every live geometry.
pub const WGS84_SRID: i64 = 4326;

/// State of the spatial index covering the live feature table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum IndexState {
    /// Queryable and consistent with the live table.
    Enabled,
    /// Under bulk mutation; envelope queries are refused.
    Disabled,
}

impl IndexState {
    /// Persisted text form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

/// Outcome of merging the staging area into the live table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MergeSummary {
    /// Sources whose live rows were replaced, ascending.
    pub sources: Vec<SourceId>,
    /// Live rows deleted before the copy.
    pub deleted: usize,
    /// Staged rows copied into the live table.
    pub copied: usize,
    /// Staged rows discarded because they could not be repaired.
    pub discarded: usize,
}

/// Read and write access to persisted features.
///
/// Coordinates use WGS84 with axis order (longitude, latitude) in degrees.
///
/// # Examples
///
/// ```rust
/// use geoharvest_core::{
///     CanonicalGeometry, IndexState, SourceId, SpatialStore, SqliteFeatureStore,
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut store = SqliteFeatureStore::open_in_memory()?;
/// let point = CanonicalGeometry::from_wkt("POINT(10 52)")?;
/// store.insert_features(SourceId(1), &[point])?;
/// assert_eq!(store.features_for_source(SourceId(1))?.len(), 1);
/// assert_eq!(store.index_state()?, IndexState::Enabled);
/// # Ok(())
/// # }
/// ```
pub trait SpatialStore {
    /// Error raised by the backing storage.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Current spatial index state.
    fn index_state(&self) -> Result<IndexState, Self::Error>;

    /// Drop the spatial index ahead of a bulk mutation.
    ///
    /// Implementations shared between processes hold the store exclusively
    /// until the next [`SpatialStore::rebuild_spatial_index`].
    fn disable_spatial_index(&mut self) -> Result<(), Self::Error>;

    /// Reassign the spatial reference on every live row and rebuild the
    /// index from scratch.
    fn rebuild_spatial_index(&mut self) -> Result<(), Self::Error>;

    /// Delete every live feature, returning the number removed.
    fn clear_features(&mut self) -> Result<usize, Self::Error>;

    /// Append features for `source` to the live table.
    fn insert_features(
        &mut self,
        source: SourceId,
        geometries: &[CanonicalGeometry],
    ) -> Result<usize, Self::Error>;

    /// Empty the staging area.
    fn truncate_staging(&mut self) -> Result<(), Self::Error>;

    /// Replace the staged rows of `source` with `geometries`.
    ///
    /// The current end of the error log is remembered as the source's
    /// success watermark, to be recorded if the rows are merged.
    fn stage_features(
        &mut self,
        source: SourceId,
        geometries: &[CanonicalGeometry],
    ) -> Result<usize, Self::Error>;

    /// Assign the spatial reference to staged rows and repair their
    /// geometries, discarding rows that cannot be repaired. Returns the
    /// number discarded.
    fn prepare_staging(&mut self) -> Result<usize, Self::Error>;

    /// Replace the live rows of every staged source with the staged rows
    /// and record a harvest success for each, as of its staging.
    ///
    /// The staging area itself is left intact until the next
    /// [`SpatialStore::truncate_staging`].
    fn merge_staging(&mut self) -> Result<MergeSummary, Self::Error>;

    /// Live features of one source, in insertion order.
    fn features_for_source(&self, source: SourceId)
    -> Result<Vec<CanonicalGeometry>, Self::Error>;

    /// Live features whose envelope intersects `bbox`.
    ///
    /// Fails while the spatial index is disabled.
    fn features_in_envelope(&self, bbox: &Rect<f64>) -> Result<Vec<Feature>, Self::Error>;

    /// Number of live features per source.
    fn feature_counts(&self) -> Result<BTreeMap<SourceId, usize>, Self::Error>;

    /// Append an entry to the harvest error log.
    fn log_harvest_error(&mut self, entry: &HarvestErrorLogEntry) -> Result<(), Self::Error>;

    /// Mark every error logged so far for `source` as resolved.
    fn record_harvest_success(&mut self, source: SourceId) -> Result<(), Self::Error>;

    /// Latest error per source logged after that source's last success,
    /// ordered by source.
    fn unresolved_errors(&self) -> Result<Vec<HarvestErrorLogEntry>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryFeatureStore;
    use geo::Coord;
    use rstest::{fixture, rstest};

    fn geometry(wkt: &str) -> CanonicalGeometry {
        CanonicalGeometry::from_wkt(wkt).expect("valid WKT")
    }

    #[fixture]
    fn store() -> MemoryFeatureStore {
        let mut store = MemoryFeatureStore::default();
        store
            .insert_features(SourceId(1), &[geometry("POINT(0 0)"), geometry("POINT(5 5)")])
            .expect("insert source 1");
        store
            .insert_features(SourceId(2), &[geometry("POINT(20 20)")])
            .expect("insert source 2");
        store
    }

    #[rstest]
    fn envelope_query_includes_boundary(store: MemoryFeatureStore) {
        let bbox = Rect::new(Coord { x: -1.0, y: -1.0 }, Coord { x: 5.0, y: 5.0 });
        let found = store.features_in_envelope(&bbox).expect("query");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|feature| feature.source_id == SourceId(1)));
    }

    #[rstest]
    fn envelope_query_refused_while_disabled(mut store: MemoryFeatureStore) {
        store.disable_spatial_index().expect("disable");
        let bbox = Rect::new(Coord { x: -1.0, y: -1.0 }, Coord { x: 1.0, y: 1.0 });
        assert!(store.features_in_envelope(&bbox).is_err());
    }

    #[rstest]
    fn merge_replaces_only_staged_sources(mut store: MemoryFeatureStore) {
        store.truncate_staging().expect("truncate");
        store
            .stage_features(SourceId(2), &[geometry("POINT(30 30)"), geometry("POINT(31 31)")])
            .expect("stage");

        let summary = store.merge_staging().expect("merge");

        assert_eq!(
            summary,
            MergeSummary {
                sources: vec![SourceId(2)],
                deleted: 1,
                copied: 2,
                discarded: 0,
            }
        );
        let counts = store.feature_counts().expect("counts");
        assert_eq!(counts.get(&SourceId(1)), Some(&2));
        assert_eq!(counts.get(&SourceId(2)), Some(&2));
    }

    #[rstest]
    fn restaging_replaces_previous_rows(mut store: MemoryFeatureStore) {
        store.truncate_staging().expect("truncate");
        store
            .stage_features(SourceId(3), &[geometry("POINT(1 1)"), geometry("POINT(2 2)")])
            .expect("first stage");
        store
            .stage_features(SourceId(3), &[geometry("POINT(3 3)")])
            .expect("second stage");

        let summary = store.merge_staging().expect("merge");
        assert_eq!(summary.copied, 1);
        assert_eq!(
            store.features_for_source(SourceId(3)).expect("features"),
            vec![geometry("POINT(3 3)")]
        );
    }

    #[rstest]
    fn success_resolves_earlier_errors(mut store: MemoryFeatureStore) {
        store
            .log_harvest_error(&HarvestErrorLogEntry {
                source_id: SourceId(1),
                message: "timeout".into(),
                logged_at: 10,
            })
            .expect("log");
        store
            .log_harvest_error(&HarvestErrorLogEntry {
                source_id: SourceId(2),
                message: "bad json".into(),
                logged_at: 11,
            })
            .expect("log");
        store.record_harvest_success(SourceId(1)).expect("success");

        let unresolved = store.unresolved_errors().expect("unresolved");
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].source_id, SourceId(2));
    }
}
