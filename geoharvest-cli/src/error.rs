//! Error types emitted by the geoharvest CLI.

use std::sync::Arc;

use camino::Utf8PathBuf;
use geoharvest_core::{
    ClusterError, ProjectionError, SourceError, SourceId, SqliteFeatureStoreError,
};
use geoharvest_data::{FetcherBuildError, LoadError};
use thiserror::Error;

/// Errors emitted by the geoharvest CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        /// Option name.
        field: &'static str,
        /// Environment variable that can supply it.
        env: &'static str,
    },
    /// An option had a value outside its accepted range.
    #[error("invalid {field}: {reason}")]
    InvalidArgument {
        /// Option name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// Reading the catalogue file failed.
    #[error("failed to read catalogue at {path:?}: {source}")]
    ReadCatalogue {
        /// Catalogue path.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The catalogue was not valid JSON.
    #[error("failed to parse catalogue JSON at {path:?}: {source}")]
    ParseCatalogue {
        /// Catalogue path.
        path: Utf8PathBuf,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
    /// A catalogue entry was rejected.
    #[error("invalid catalogue entry in {path:?}: {source}")]
    InvalidSource {
        /// Catalogue path.
        path: Utf8PathBuf,
        /// Validation failure.
        #[source]
        source: SourceError,
    },
    /// Two catalogue entries share an identifier.
    #[error("catalogue {path:?} lists source {id} more than once")]
    DuplicateSource {
        /// Catalogue path.
        path: Utf8PathBuf,
        /// Repeated identifier.
        id: SourceId,
    },
    /// The requested source is not in the catalogue.
    #[error("source {id} is not in catalogue {path:?}")]
    UnknownSource {
        /// Catalogue path.
        path: Utf8PathBuf,
        /// Requested identifier.
        id: SourceId,
    },
    /// Opening or using the feature store failed.
    #[error(transparent)]
    Store(#[from] SqliteFeatureStoreError),
    /// The loader stopped on a store or index failure.
    #[error(transparent)]
    Load(#[from] LoadError<SqliteFeatureStoreError>),
    /// Building the HTTP harvester failed.
    #[error(transparent)]
    BuildHarvester(#[from] FetcherBuildError),
    /// Building the async runtime failed.
    #[error("failed to build async runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// Clustering stored features failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    /// Projecting stored features for coverage failed.
    #[error("failed to compute coverage: {0}")]
    Coverage(#[from] ProjectionError),
    /// Serializing command output failed.
    #[error("failed to serialize output: {0}")]
    SerializeOutput(#[source] serde_json::Error),
    /// Writing command output failed.
    #[error("failed to write output: {0}")]
    WriteOutput(#[source] std::io::Error),
}
