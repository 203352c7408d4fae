//! Bulk loading of harvested features into a [`SpatialStore`].
//!
//! Two modes are offered:
//!
//! - [`BulkLoader::full_rebuild`] empties the live table and repopulates it
//!   from every source in turn.
//! - The incremental cycle ([`BulkLoader::begin_incremental`],
//!   [`BulkLoader::refresh_source`], [`BulkLoader::finish_incremental`])
//!   replaces the live rows of individually refreshed sources and leaves
//!   every other source untouched.
//!
//! Every bulk mutation of the live table runs while a
//! [`SpatialIndexGuard`] holds the store, so the index is rebuilt on every
//! exit path and no other loader can enter the same window. A failed source harvest is logged to the store's error log and
//! never aborts the run; store failures are fatal.
//!
//! # Example
//!
//! ```no_run
//! use geoharvest_core::{Source, SourceId, SqliteFeatureStore};
//! use geoharvest_data::harvest::HttpHarvester;
//! use geoharvest_data::loader::{BulkLoader, BulkLoaderConfig};
//! use geoharvest_data::service::HttpFetcherConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = SqliteFeatureStore::open_in_memory()?;
//! let harvester = HttpHarvester::new(HttpFetcherConfig::default())?;
//! let loader = BulkLoader::new(harvester, BulkLoaderConfig::default());
//! let sources = vec![Source::new(SourceId(1), "https://geo.example.org/wfs", "parks")?];
//!
//! let report = loader.full_rebuild(&mut store, &sources).await?;
//! println!("{} sources failed", report.failed().count());
//! # Ok(())
//! # }
//! ```

use geoharvest_core::{
    CanonicalGeometry, HarvestErrorLogEntry, MergeSummary, Source, SourceId, SpatialIndexGuard,
    SpatialStore,
};
use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::harvest::SourceHarvester;

mod summary;

pub use summary::HarvestSummary;

/// Default number of rows written per live-table insert.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Configuration for [`BulkLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkLoaderConfig {
    /// Rows written per live-table insert call. Zero is treated as one.
    pub batch_size: usize,
}

impl Default for BulkLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl BulkLoaderConfig {
    /// Set the insert batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Fatal loader failure.
#[derive(Debug, Error)]
pub enum LoadError<E> {
    /// A store operation failed.
    #[error("spatial store operation failed: {0}")]
    Store(#[source] E),
    /// Disabling or rebuilding the spatial index failed.
    #[error("spatial index lifecycle failed: {0}")]
    Index(#[source] E),
}

/// Result of one source within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    /// Every page was fetched and decoded.
    Harvested {
        /// Features written for the source.
        features: usize,
    },
    /// The harvest failed and was logged.
    Failed {
        /// Failure description, as logged.
        message: String,
    },
}

/// Outcome of one source, tagged with its identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    /// Harvested source.
    pub source_id: SourceId,
    /// What happened.
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

/// Per-source outcomes of a full rebuild, in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// One entry per source.
    pub sources: Vec<SourceReport>,
}

impl RunReport {
    /// Reports of sources that failed.
    pub fn failed(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources
            .iter()
            .filter(|report| matches!(report.outcome, SourceOutcome::Failed { .. }))
    }

    /// Total features written across all sources.
    #[must_use]
    pub fn feature_total(&self) -> usize {
        self.sources
            .iter()
            .map(|report| match report.outcome {
                SourceOutcome::Harvested { features } => features,
                SourceOutcome::Failed { .. } => 0,
            })
            .sum()
    }
}

/// Drives harvests into a [`SpatialStore`].
#[derive(Debug)]
pub struct BulkLoader<H> {
    harvester: H,
    config: BulkLoaderConfig,
}

impl<H> BulkLoader<H>
where
    H: SourceHarvester,
{
    /// Create a loader using `harvester`.
    pub const fn new(harvester: H, config: BulkLoaderConfig) -> Self {
        Self { harvester, config }
    }

    /// Borrow the harvester.
    pub const fn harvester(&self) -> &H {
        &self.harvester
    }

    /// Empty the live table and repopulate it from `sources` in order.
    ///
    /// The spatial index is disabled first and rebuilt exactly once at the
    /// end, whatever happened in between. The store is held exclusively for
    /// that whole window, so a second rebuild or merge against the same
    /// database fails at its disable step. Sources whose harvest fails end
    /// the run with no features.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Index`] when the index cannot be disabled or
    /// rebuilt, and [`LoadError::Store`] when any other store operation
    /// fails. Harvest failures are reported in the [`RunReport`] instead.
    pub async fn full_rebuild<S>(
        &self,
        store: &mut S,
        sources: &[Source],
    ) -> Result<RunReport, LoadError<S::Error>>
    where
        S: SpatialStore,
    {
        info!("full rebuild of {} sources", sources.len());
        let mut guard = SpatialIndexGuard::disable(store).map_err(LoadError::Index)?;
        let populated = self.populate(&mut *guard, sources).await;
        let report = settle(populated, guard.rebuild())?;
        info!(
            "full rebuild finished: {} features, {} failed sources",
            report.feature_total(),
            report.failed().count()
        );
        Ok(report)
    }

    async fn populate<S>(&self, store: &mut S, sources: &[Source]) -> Result<RunReport, S::Error>
    where
        S: SpatialStore,
    {
        let cleared = store.clear_features()?;
        info!("cleared {cleared} live features");
        let mut report = RunReport::default();
        for source in sources {
            let outcome = match self.harvester.harvest(source).await {
                Ok(geometries) => {
                    let features = self.insert_batched(store, source.id, &geometries)?;
                    store.record_harvest_success(source.id)?;
                    info!("source {} loaded with {features} features", source.id);
                    SourceOutcome::Harvested { features }
                }
                Err(err) => record_failure(store, source.id, &err)?,
            };
            report.sources.push(SourceReport {
                source_id: source.id,
                outcome,
            });
        }
        Ok(report)
    }

    fn insert_batched<S>(
        &self,
        store: &mut S,
        source: SourceId,
        geometries: &[CanonicalGeometry],
    ) -> Result<usize, S::Error>
    where
        S: SpatialStore,
    {
        let mut inserted = 0;
        for batch in geometries.chunks(self.config.batch_size.max(1)) {
            inserted += store.insert_features(source, batch)?;
        }
        Ok(inserted)
    }

    /// Start an incremental cycle by emptying the staging area.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Store`] if the staging area cannot be emptied.
    pub fn begin_incremental<S>(&self, store: &mut S) -> Result<(), LoadError<S::Error>>
    where
        S: SpatialStore,
    {
        store.truncate_staging().map_err(LoadError::Store)?;
        info!("incremental cycle started");
        Ok(())
    }

    /// Harvest one source into the staging area.
    ///
    /// A successful harvest replaces whatever was staged for the source
    /// earlier in the cycle; its success only resolves logged errors once
    /// [`BulkLoader::finish_incremental`] merges it. A failed harvest is
    /// logged and leaves earlier staged rows in place.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Store`] if staging or logging fails.
    pub async fn refresh_source<S>(
        &self,
        store: &mut S,
        source: &Source,
    ) -> Result<SourceOutcome, LoadError<S::Error>>
    where
        S: SpatialStore,
    {
        match self.harvester.harvest(source).await {
            Ok(geometries) => {
                let features = store
                    .stage_features(source.id, &geometries)
                    .map_err(LoadError::Store)?;
                info!("source {} staged with {features} features", source.id);
                Ok(SourceOutcome::Harvested { features })
            }
            Err(err) => record_failure(store, source.id, &err).map_err(LoadError::Store),
        }
    }

    /// Merge the staging area into the live table.
    ///
    /// Staged rows get their spatial reference and are repaired; rows that
    /// cannot be repaired are discarded. The live rows of every staged source
    /// are then replaced while the index is disabled, and the index is
    /// rebuilt whatever the merge outcome. Merged sources count as
    /// successfully harvested from the point they were staged.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Store`] if preparation or the merge fails and
    /// [`LoadError::Index`] if the index cannot be disabled or rebuilt.
    pub fn finish_incremental<S>(&self, store: &mut S) -> Result<MergeSummary, LoadError<S::Error>>
    where
        S: SpatialStore,
    {
        let discarded = store.prepare_staging().map_err(LoadError::Store)?;
        if discarded > 0 {
            warn!("discarded {discarded} staged features that could not be repaired");
        }
        let mut guard = SpatialIndexGuard::disable(store).map_err(LoadError::Index)?;
        let merged = guard.merge_staging();
        let mut summary = settle(merged, guard.rebuild())?;
        summary.discarded = discarded;
        info!(
            "incremental cycle finished: {} sources, {} rows replaced by {}",
            summary.sources.len(),
            summary.deleted,
            summary.copied
        );
        Ok(summary)
    }
}

fn record_failure<S, E>(store: &mut S, source: SourceId, err: &E) -> Result<SourceOutcome, S::Error>
where
    S: SpatialStore,
    E: std::error::Error,
{
    let message = err.to_string();
    warn!("harvest of source {source} failed: {message}");
    store.log_harvest_error(&HarvestErrorLogEntry::now(source, message.clone()))?;
    Ok(SourceOutcome::Failed { message })
}

/// Combine the result of a bulk mutation with the index rebuild that
/// followed it. A mutation failure takes precedence.
fn settle<T, E>(mutation: Result<T, E>, rebuild: Result<(), E>) -> Result<T, LoadError<E>>
where
    E: std::fmt::Display,
{
    match (mutation, rebuild) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(LoadError::Index(err)),
        (Err(err), Ok(())) => Err(LoadError::Store(err)),
        (Err(err), Err(index)) => {
            error!("spatial index rebuild failed after store error: {index}");
            Err(LoadError::Store(err))
        }
    }
}
