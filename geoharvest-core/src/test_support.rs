//! Test-only, in-memory `SpatialStore` implementation used by unit and
//! behaviour tests.

use std::collections::{BTreeMap, BTreeSet};

use geo::{Intersects, Rect};
use thiserror::Error;

use crate::{
    CanonicalGeometry, Feature, HarvestErrorLogEntry, IndexState, MergeSummary, SourceId,
    SpatialStore,
};

/// Errors raised by [`MemoryFeatureStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryStoreError {
    /// Envelope query issued while the index was disabled.
    #[error("spatial index is disabled")]
    IndexDisabled,
    /// A failure injected by the test.
    #[error("injected failure during {operation}")]
    Injected {
        /// Name of the failing operation.
        operation: &'static str,
    },
}

/// In-memory `SpatialStore` implementation used in tests.
///
/// The store performs linear scans and is intended only for small datasets.
/// Failures can be injected for inserts and index rebuilds.
#[derive(Debug, Clone)]
pub struct MemoryFeatureStore {
    live: Vec<Feature>,
    staging: Vec<Feature>,
    index: IndexState,
    errors: Vec<HarvestErrorLogEntry>,
    watermarks: BTreeMap<SourceId, usize>,
    staged_watermarks: BTreeMap<SourceId, usize>,
    rebuilds: usize,
    fail_rebuilds: bool,
    fail_inserts: bool,
}

impl Default for MemoryFeatureStore {
    fn default() -> Self {
        Self {
            live: Vec::new(),
            staging: Vec::new(),
            index: IndexState::Enabled,
            errors: Vec::new(),
            watermarks: BTreeMap::new(),
            staged_watermarks: BTreeMap::new(),
            rebuilds: 0,
            fail_rebuilds: false,
            fail_inserts: false,
        }
    }
}

impl MemoryFeatureStore {
    /// Create a store pre-populated with live features for one source.
    pub fn with_features<I>(source: SourceId, geometries: I) -> Self
    where
        I: IntoIterator<Item = CanonicalGeometry>,
    {
        Self {
            live: geometries
                .into_iter()
                .map(|geometry| Feature {
                    source_id: source,
                    geometry,
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Make every subsequent index rebuild fail.
    #[must_use]
    pub fn failing_rebuilds(mut self) -> Self {
        self.fail_rebuilds = true;
        self
    }

    /// Make every subsequent live or staged insert fail.
    #[must_use]
    pub fn failing_inserts(mut self) -> Self {
        self.fail_inserts = true;
        self
    }

    /// Number of index rebuilds performed so far.
    #[must_use]
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }

    /// Every logged error, resolved or not.
    #[must_use]
    pub fn logged_errors(&self) -> &[HarvestErrorLogEntry] {
        &self.errors
    }

    /// Features currently staged.
    #[must_use]
    pub fn staged(&self) -> &[Feature] {
        &self.staging
    }

    fn check_insert(&self) -> Result<(), MemoryStoreError> {
        if self.fail_inserts {
            return Err(MemoryStoreError::Injected {
                operation: "insert",
            });
        }
        Ok(())
    }
}

fn tagged(
    source: SourceId,
    geometries: &[CanonicalGeometry],
) -> impl Iterator<Item = Feature> + '_ {
    geometries.iter().cloned().map(move |geometry| Feature {
        source_id: source,
        geometry,
    })
}

impl SpatialStore for MemoryFeatureStore {
    type Error = MemoryStoreError;

    fn index_state(&self) -> Result<IndexState, Self::Error> {
        Ok(self.index)
    }

    fn disable_spatial_index(&mut self) -> Result<(), Self::Error> {
        self.index = IndexState::Disabled;
        Ok(())
    }

    fn rebuild_spatial_index(&mut self) -> Result<(), Self::Error> {
        if self.fail_rebuilds {
            return Err(MemoryStoreError::Injected {
                operation: "rebuild",
            });
        }
        self.rebuilds += 1;
        self.index = IndexState::Enabled;
        Ok(())
    }

    fn clear_features(&mut self) -> Result<usize, Self::Error> {
        let removed = self.live.len();
        self.live.clear();
        Ok(removed)
    }

    fn insert_features(
        &mut self,
        source: SourceId,
        geometries: &[CanonicalGeometry],
    ) -> Result<usize, Self::Error> {
        self.check_insert()?;
        self.live.extend(tagged(source, geometries));
        Ok(geometries.len())
    }

    fn truncate_staging(&mut self) -> Result<(), Self::Error> {
        self.staging.clear();
        self.staged_watermarks.clear();
        Ok(())
    }

    fn stage_features(
        &mut self,
        source: SourceId,
        geometries: &[CanonicalGeometry],
    ) -> Result<usize, Self::Error> {
        self.check_insert()?;
        self.staging.retain(|feature| feature.source_id != source);
        self.staging.extend(tagged(source, geometries));
        self.staged_watermarks.insert(source, self.errors.len());
        Ok(geometries.len())
    }

    fn prepare_staging(&mut self) -> Result<usize, Self::Error> {
        let before = self.staging.len();
        self.staging = std::mem::take(&mut self.staging)
            .into_iter()
            .filter_map(|feature| {
                feature.geometry.repaired().ok().map(|geometry| Feature {
                    source_id: feature.source_id,
                    geometry,
                })
            })
            .collect();
        Ok(before - self.staging.len())
    }

    fn merge_staging(&mut self) -> Result<MergeSummary, Self::Error> {
        let sources: BTreeSet<SourceId> =
            self.staging.iter().map(|feature| feature.source_id).collect();
        let before = self.live.len();
        self.live
            .retain(|feature| !sources.contains(&feature.source_id));
        let deleted = before - self.live.len();
        self.live.extend(self.staging.iter().cloned());
        for source in &sources {
            if let Some(&staged) = self.staged_watermarks.get(source) {
                let watermark = self.watermarks.entry(*source).or_default();
                *watermark = (*watermark).max(staged);
            }
        }
        Ok(MergeSummary {
            sources: sources.into_iter().collect(),
            deleted,
            copied: self.staging.len(),
            discarded: 0,
        })
    }

    fn features_for_source(
        &self,
        source: SourceId,
    ) -> Result<Vec<CanonicalGeometry>, Self::Error> {
        Ok(self
            .live
            .iter()
            .filter(|feature| feature.source_id == source)
            .map(|feature| feature.geometry.clone())
            .collect())
    }

    fn features_in_envelope(&self, bbox: &Rect<f64>) -> Result<Vec<Feature>, Self::Error> {
        if self.index == IndexState::Disabled {
            return Err(MemoryStoreError::IndexDisabled);
        }
        Ok(self
            .live
            .iter()
            // `Intersects` treats boundary contact as intersection.
            .filter(|feature| bbox.intersects(&feature.geometry.envelope()))
            .cloned()
            .collect())
    }

    fn feature_counts(&self) -> Result<BTreeMap<SourceId, usize>, Self::Error> {
        let mut counts = BTreeMap::new();
        for feature in &self.live {
            *counts.entry(feature.source_id).or_default() += 1;
        }
        Ok(counts)
    }

    fn log_harvest_error(&mut self, entry: &HarvestErrorLogEntry) -> Result<(), Self::Error> {
        self.errors.push(entry.clone());
        Ok(())
    }

    fn record_harvest_success(&mut self, source: SourceId) -> Result<(), Self::Error> {
        self.watermarks.insert(source, self.errors.len());
        Ok(())
    }

    fn unresolved_errors(&self) -> Result<Vec<HarvestErrorLogEntry>, Self::Error> {
        let mut latest: BTreeMap<SourceId, &HarvestErrorLogEntry> = BTreeMap::new();
        for (position, entry) in self.errors.iter().enumerate() {
            let watermark = self.watermarks.get(&entry.source_id).copied().unwrap_or(0);
            if position >= watermark {
                latest.insert(entry.source_id, entry);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }
}
