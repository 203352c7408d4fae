//! Command-line interface for harvesting external feature layers.
#![forbid(unsafe_code)]

use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use geoharvest_core::SourceId;
use geoharvest_data::{BulkLoaderConfig, HttpFetcherConfig};
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

mod catalogue;
mod commands;
mod error;

pub use error::CliError;

const ARG_DATABASE: &str = "database";
const ARG_CATALOGUE: &str = "catalogue";
const ARG_SOURCE_ID: &str = "source-id";
const ARG_THRESHOLD: &str = "threshold";
const ARG_TIMEOUT_SECS: &str = "timeout-secs";
const ARG_PAGE_SIZE: &str = "page-size";
const ARG_BATCH_SIZE: &str = "batch-size";
const ARG_PHASE: &str = "phase";
const ENV_REBUILD_CATALOGUE: &str = "GEOHARVEST_CMDS_REBUILD_CATALOGUE";
const ENV_INCREMENTAL_PHASE: &str = "GEOHARVEST_CMDS_INCREMENTAL_PHASE";
const ENV_INCREMENTAL_CATALOGUE: &str = "GEOHARVEST_CMDS_INCREMENTAL_CATALOGUE";
const ENV_INCREMENTAL_SOURCE_ID: &str = "GEOHARVEST_CMDS_INCREMENTAL_SOURCE_ID";
const ENV_ANALYSE_SOURCE_ID: &str = "GEOHARVEST_CMDS_ANALYSE_SOURCE_ID";
const ENV_ANALYSE_THRESHOLD: &str = "GEOHARVEST_CMDS_ANALYSE_THRESHOLD";

/// Database used when none is configured.
const DEFAULT_DATABASE: &str = "geoharvest.db";

/// Run the geoharvest CLI with the current process arguments and environment.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    let mut stdout = std::io::stdout().lock();
    match cli.command {
        Command::Rebuild(args) => commands::run_rebuild(&args.into_config()?, &mut stdout),
        Command::Incremental(args) => {
            commands::run_incremental(&args.into_config()?, &mut stdout)
        }
        Command::Summary(args) => commands::run_summary(&args.into_config()?, &mut stdout),
        Command::Analyse(args) => {
            commands::run_analyse(&args.into_config()?, &mut stdout).map(|_| ())
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "geoharvest",
    about = "Harvest external feature layers into a spatial store",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Clear the live table and harvest every catalogued source.
    Rebuild(RebuildArgs),
    /// Refresh individual sources through the staging area.
    Incremental(IncrementalArgs),
    /// Report sources whose latest harvest failed.
    Summary(SummaryArgs),
    /// Cluster a source's stored features and estimate its coverage.
    Analyse(AnalyseArgs),
}

/// CLI arguments for the `rebuild` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Empty the live feature table and harvest every source in \
                 the catalogue. Sources that fail are logged and left empty; \
                 the spatial index is rebuilt once at the end.",
    about = "Run a full rebuild"
)]
#[ortho_config(prefix = "GEOHARVEST")]
struct RebuildArgs {
    /// Path to the SQLite feature store.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    database: Option<Utf8PathBuf>,
    /// Path to the JSON source catalogue.
    #[arg(long = ARG_CATALOGUE, value_name = "path")]
    #[serde(default)]
    catalogue: Option<Utf8PathBuf>,
    /// Per-request timeout in seconds.
    #[arg(long = ARG_TIMEOUT_SECS, value_name = "secs")]
    #[serde(default)]
    timeout_secs: Option<u64>,
    /// Features requested per page from WFS services.
    #[arg(long = ARG_PAGE_SIZE, value_name = "count")]
    #[serde(default)]
    page_size: Option<u32>,
    /// Rows written per live-table insert.
    #[arg(long = ARG_BATCH_SIZE, value_name = "count")]
    #[serde(default)]
    batch_size: Option<usize>,
}

impl RebuildArgs {
    fn into_config(self) -> Result<RebuildConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        RebuildConfig::try_from(merged)
    }
}

/// Phase of an incremental cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum IncrementalPhase {
    /// Empty the staging area.
    Start,
    /// Harvest one source into the staging area.
    Harvest,
    /// Merge the staging area into the live table.
    Finish,
}

/// CLI arguments for the `incremental` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Run one phase of an incremental cycle: `start` empties the \
                 staging area, `harvest` stages one source, and `finish` \
                 replaces the live rows of every staged source.",
    about = "Run an incremental cycle phase"
)]
#[ortho_config(prefix = "GEOHARVEST")]
struct IncrementalArgs {
    /// Cycle phase to run.
    #[arg(value_enum, value_name = ARG_PHASE)]
    #[serde(default)]
    phase: Option<IncrementalPhase>,
    /// Path to the SQLite feature store.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    database: Option<Utf8PathBuf>,
    /// Path to the JSON source catalogue.
    #[arg(long = ARG_CATALOGUE, value_name = "path")]
    #[serde(default)]
    catalogue: Option<Utf8PathBuf>,
    /// Identifier of the source to harvest.
    #[arg(long = ARG_SOURCE_ID, value_name = "id")]
    #[serde(default)]
    source_id: Option<u64>,
    /// Per-request timeout in seconds.
    #[arg(long = ARG_TIMEOUT_SECS, value_name = "secs")]
    #[serde(default)]
    timeout_secs: Option<u64>,
    /// Features requested per page from WFS services.
    #[arg(long = ARG_PAGE_SIZE, value_name = "count")]
    #[serde(default)]
    page_size: Option<u32>,
}

impl IncrementalArgs {
    fn into_config(self) -> Result<IncrementalConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        IncrementalConfig::try_from(merged)
    }
}

/// Output format of the `summary` subcommand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// A JSON document.
    Json,
}

/// CLI arguments for the `summary` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(about = "List the latest unresolved harvest error per source")]
#[ortho_config(prefix = "GEOHARVEST")]
struct SummaryArgs {
    /// Path to the SQLite feature store.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    database: Option<Utf8PathBuf>,
    /// Output format.
    #[arg(long, value_enum)]
    #[serde(default)]
    format: Option<OutputFormat>,
}

impl SummaryArgs {
    fn into_config(self) -> Result<SummaryConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        Ok(SummaryConfig::from(merged))
    }
}

/// CLI arguments for the `analyse` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Group a source's stored features into clusters of features \
                 closer than the threshold (in metres, measured in an \
                 equal-area projection) and estimate how much of the \
                 source's envelope they cover. With a catalogue, coverage of \
                 the source's declared bounding box is reported as well.",
    about = "Cluster and measure a source's features"
)]
#[ortho_config(prefix = "GEOHARVEST")]
struct AnalyseArgs {
    /// Path to the SQLite feature store.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    database: Option<Utf8PathBuf>,
    /// Path to the JSON source catalogue.
    #[arg(long = ARG_CATALOGUE, value_name = "path")]
    #[serde(default)]
    catalogue: Option<Utf8PathBuf>,
    /// Identifier of the source to analyse.
    #[arg(long = ARG_SOURCE_ID, value_name = "id")]
    #[serde(default)]
    source_id: Option<u64>,
    /// Clustering distance threshold in metres.
    #[arg(long = ARG_THRESHOLD, value_name = "metres")]
    #[serde(default)]
    threshold: Option<f64>,
}

impl AnalyseArgs {
    fn into_config(self) -> Result<AnalyseConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        AnalyseConfig::try_from(merged)
    }
}

/// HTTP and loader settings shared by harvesting commands.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HarvestSettings {
    fetcher: HttpFetcherConfig,
    loader: BulkLoaderConfig,
}

impl HarvestSettings {
    fn resolve(
        timeout_secs: Option<u64>,
        page_size: Option<u32>,
        batch_size: Option<usize>,
    ) -> Result<Self, CliError> {
        let mut fetcher = HttpFetcherConfig::default();
        if let Some(secs) = timeout_secs {
            fetcher = fetcher.with_timeout(Duration::from_secs(positive(ARG_TIMEOUT_SECS, secs)?));
        }
        if let Some(size) = page_size {
            fetcher = fetcher.with_page_size(positive(ARG_PAGE_SIZE, size)?);
        }
        let mut loader = BulkLoaderConfig::default();
        if let Some(size) = batch_size {
            loader = loader.with_batch_size(positive(ARG_BATCH_SIZE, size)?);
        }
        Ok(Self { fetcher, loader })
    }
}

fn positive<T>(field: &'static str, value: T) -> Result<T, CliError>
where
    T: Default + PartialEq,
{
    if value == T::default() {
        return Err(CliError::InvalidArgument {
            field,
            reason: "must be greater than zero".to_owned(),
        });
    }
    Ok(value)
}

fn database_or_default(database: Option<Utf8PathBuf>) -> Utf8PathBuf {
    database.unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_DATABASE))
}

/// Resolved `rebuild` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RebuildConfig {
    database: Utf8PathBuf,
    catalogue: Utf8PathBuf,
    settings: HarvestSettings,
}

impl TryFrom<RebuildArgs> for RebuildConfig {
    type Error = CliError;

    fn try_from(args: RebuildArgs) -> Result<Self, Self::Error> {
        let catalogue = args.catalogue.ok_or(CliError::MissingArgument {
            field: ARG_CATALOGUE,
            env: ENV_REBUILD_CATALOGUE,
        })?;
        Ok(Self {
            database: database_or_default(args.database),
            catalogue,
            settings: HarvestSettings::resolve(args.timeout_secs, args.page_size, args.batch_size)?,
        })
    }
}

/// What an `incremental` invocation does.
#[derive(Debug, Clone, PartialEq, Eq)]
enum IncrementalStep {
    Start,
    Harvest {
        catalogue: Utf8PathBuf,
        source_id: SourceId,
    },
    Finish,
}

/// Resolved `incremental` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IncrementalConfig {
    database: Utf8PathBuf,
    step: IncrementalStep,
    settings: HarvestSettings,
}

impl TryFrom<IncrementalArgs> for IncrementalConfig {
    type Error = CliError;

    fn try_from(args: IncrementalArgs) -> Result<Self, Self::Error> {
        let phase = args.phase.ok_or(CliError::MissingArgument {
            field: ARG_PHASE,
            env: ENV_INCREMENTAL_PHASE,
        })?;
        let step = match phase {
            IncrementalPhase::Start => IncrementalStep::Start,
            IncrementalPhase::Finish => IncrementalStep::Finish,
            IncrementalPhase::Harvest => IncrementalStep::Harvest {
                catalogue: args.catalogue.ok_or(CliError::MissingArgument {
                    field: ARG_CATALOGUE,
                    env: ENV_INCREMENTAL_CATALOGUE,
                })?,
                source_id: args.source_id.map(SourceId).ok_or(CliError::MissingArgument {
                    field: ARG_SOURCE_ID,
                    env: ENV_INCREMENTAL_SOURCE_ID,
                })?,
            },
        };
        Ok(Self {
            database: database_or_default(args.database),
            step,
            settings: HarvestSettings::resolve(args.timeout_secs, args.page_size, None)?,
        })
    }
}

/// Resolved `summary` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SummaryConfig {
    database: Utf8PathBuf,
    format: OutputFormat,
}

impl From<SummaryArgs> for SummaryConfig {
    fn from(args: SummaryArgs) -> Self {
        Self {
            database: database_or_default(args.database),
            format: args.format.unwrap_or_default(),
        }
    }
}

/// Resolved `analyse` command configuration.
#[derive(Debug, Clone, PartialEq)]
struct AnalyseConfig {
    database: Utf8PathBuf,
    catalogue: Option<Utf8PathBuf>,
    source_id: SourceId,
    threshold: f64,
}

impl TryFrom<AnalyseArgs> for AnalyseConfig {
    type Error = CliError;

    fn try_from(args: AnalyseArgs) -> Result<Self, Self::Error> {
        let source_id = args.source_id.map(SourceId).ok_or(CliError::MissingArgument {
            field: ARG_SOURCE_ID,
            env: ENV_ANALYSE_SOURCE_ID,
        })?;
        let threshold = args.threshold.ok_or(CliError::MissingArgument {
            field: ARG_THRESHOLD,
            env: ENV_ANALYSE_THRESHOLD,
        })?;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(CliError::InvalidArgument {
                field: ARG_THRESHOLD,
                reason: format!("{threshold} is not a finite, non-negative distance"),
            });
        }
        Ok(Self {
            database: database_or_default(args.database),
            catalogue: args.catalogue,
            source_id,
            threshold,
        })
    }
}

#[cfg(test)]
mod tests;
