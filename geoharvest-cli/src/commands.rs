//! Command runners for the geoharvest CLI.
//!
//! Each command has a `*_with` variant taking the harvester and output
//! writer so tests can drive it without network access or stdout.

use std::io::Write;

use camino::Utf8Path;
use geo::{Coord, Rect};
use geoharvest_core::{
    CanonicalGeometry, ClusterGroup, LambertAzimuthalEqualArea, MergeSummary, SourceId,
    SpatialStore, SqliteFeatureStore, cluster, coverage, coverage_within,
};
use geoharvest_data::{
    BulkLoader, HarvestSummary, HttpHarvester, RunReport, SourceHarvester, SourceReport,
};
use log::info;
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::catalogue::{find_source, load_catalogue};
use crate::{
    AnalyseConfig, CliError, IncrementalConfig, IncrementalStep, OutputFormat, RebuildConfig,
    SummaryConfig,
};

pub(crate) fn run_rebuild(config: &RebuildConfig, writer: &mut dyn Write) -> Result<(), CliError> {
    let harvester = HttpHarvester::new(config.settings.fetcher.clone())?;
    run_rebuild_with(config, harvester, writer).map(|_| ())
}

pub(crate) fn run_rebuild_with<H>(
    config: &RebuildConfig,
    harvester: H,
    writer: &mut dyn Write,
) -> Result<RunReport, CliError>
where
    H: SourceHarvester,
{
    let sources = load_catalogue(&config.catalogue)?;
    let mut store = open_store(&config.database)?;
    let loader = BulkLoader::new(harvester, config.settings.loader);
    let report = runtime()?.block_on(loader.full_rebuild(&mut store, &sources))?;
    write_json(writer, &report)?;
    Ok(report)
}

/// Output of one `incremental` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IncrementalOutcome {
    Started,
    Staged(SourceReport),
    Merged(MergeSummary),
}

pub(crate) fn run_incremental(
    config: &IncrementalConfig,
    writer: &mut dyn Write,
) -> Result<(), CliError> {
    let harvester = HttpHarvester::new(config.settings.fetcher.clone())?;
    run_incremental_with(config, harvester, writer).map(|_| ())
}

pub(crate) fn run_incremental_with<H>(
    config: &IncrementalConfig,
    harvester: H,
    writer: &mut dyn Write,
) -> Result<IncrementalOutcome, CliError>
where
    H: SourceHarvester,
{
    let mut store = open_store(&config.database)?;
    let loader = BulkLoader::new(harvester, config.settings.loader);
    match &config.step {
        IncrementalStep::Start => {
            loader.begin_incremental(&mut store)?;
            Ok(IncrementalOutcome::Started)
        }
        IncrementalStep::Harvest {
            catalogue,
            source_id,
        } => {
            let source = find_source(load_catalogue(catalogue)?, *source_id, catalogue)?;
            let outcome = runtime()?.block_on(loader.refresh_source(&mut store, &source))?;
            let report = SourceReport {
                source_id: source.id,
                outcome,
            };
            write_json(writer, &report)?;
            Ok(IncrementalOutcome::Staged(report))
        }
        IncrementalStep::Finish => {
            let summary = loader.finish_incremental(&mut store)?;
            write_json(writer, &summary)?;
            Ok(IncrementalOutcome::Merged(summary))
        }
    }
}

pub(crate) fn run_summary(
    config: &SummaryConfig,
    writer: &mut dyn Write,
) -> Result<(), CliError> {
    let store = open_store(&config.database)?;
    let summary = HarvestSummary::from_store(&store)?;
    match config.format {
        OutputFormat::Text => write!(writer, "{summary}").map_err(CliError::WriteOutput),
        OutputFormat::Json => write_json(writer, &summary),
    }
}

/// Clustering and coverage figures for one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct AnalysisReport {
    pub(crate) source_id: SourceId,
    pub(crate) features: usize,
    pub(crate) threshold_m: f64,
    pub(crate) groups: Vec<ClusterGroup>,
    pub(crate) coverage: Option<f64>,
    pub(crate) bbox_coverage: Option<f64>,
}

pub(crate) fn run_analyse(
    config: &AnalyseConfig,
    writer: &mut dyn Write,
) -> Result<AnalysisReport, CliError> {
    let store = open_store(&config.database)?;
    let geometries = store.features_for_source(config.source_id)?;
    let projection = projection_for(&geometries);
    let groups = cluster(&geometries, config.threshold, &projection)?;
    let overall = coverage(&geometries, &projection)?;
    let bbox_coverage = match &config.catalogue {
        Some(path) => {
            let source = find_source(load_catalogue(path)?, config.source_id, path)?;
            match source.bbox {
                Some(bbox) => coverage_within(&geometries, bbox, &projection)?,
                None => None,
            }
        }
        None => None,
    };
    info!(
        "source {} has {} features in {} clusters",
        config.source_id,
        geometries.len(),
        groups.len()
    );
    let report = AnalysisReport {
        source_id: config.source_id,
        features: geometries.len(),
        threshold_m: config.threshold,
        groups,
        coverage: overall,
        bbox_coverage,
    };
    write_json(writer, &report)?;
    Ok(report)
}

/// Equal-area projection centred on the features' combined envelope.
fn projection_for(geometries: &[CanonicalGeometry]) -> LambertAzimuthalEqualArea {
    geometries
        .iter()
        .map(CanonicalGeometry::envelope)
        .reduce(|acc, next| {
            Rect::new(
                Coord {
                    x: acc.min().x.min(next.min().x),
                    y: acc.min().y.min(next.min().y),
                },
                Coord {
                    x: acc.max().x.max(next.max().x),
                    y: acc.max().y.max(next.max().y),
                },
            )
        })
        .map_or_else(LambertAzimuthalEqualArea::default, |bounds| {
            let centre = bounds.center();
            LambertAzimuthalEqualArea::new(centre.x, centre.y)
        })
}

fn open_store(path: &Utf8Path) -> Result<SqliteFeatureStore, CliError> {
    Ok(SqliteFeatureStore::open(path)?)
}

/// Single-threaded runtime with the timer driver the HTTP timeouts need.
pub(crate) fn runtime() -> Result<Runtime, CliError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)
}

fn write_json<T>(writer: &mut dyn Write, value: &T) -> Result<(), CliError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_writer_pretty(&mut *writer, value).map_err(CliError::SerializeOutput)?;
    writeln!(writer).map_err(CliError::WriteOutput)
}
