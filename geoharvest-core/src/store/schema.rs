//! SQLite schema for the feature store.

use rusqlite::{Connection, OptionalExtension, Transaction};

use super::sqlite::SqliteFeatureStoreError;

/// Version recorded in `geoharvest_schema_version`.
pub const SCHEMA_VERSION: i64 = 2;

/// Whether the database already records this build's schema version.
///
/// Only reads, so it succeeds while another connection holds a write lock.
pub(super) fn is_current(connection: &Connection) -> Result<bool, SqliteFeatureStoreError> {
    let read_error = |source| SqliteFeatureStoreError::Migration {
        step: "read schema version",
        source,
    };
    let recorded: bool = connection
        .query_row(
            "SELECT EXISTS (
                SELECT 1 FROM sqlite_master
                WHERE type = 'table' AND name = 'geoharvest_schema_version')",
            [],
            |row| row.get(0),
        )
        .map_err(read_error)?;
    if !recorded {
        return Ok(false);
    }
    let version: Option<i64> = connection
        .query_row(
            "SELECT version FROM geoharvest_schema_version LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(read_error)?;
    Ok(version == Some(SCHEMA_VERSION))
}

/// Create every table idempotently and check the recorded schema version.
pub(super) fn initialise(transaction: &Transaction<'_>) -> Result<(), SqliteFeatureStoreError> {
    create_feature_tables(transaction)?;
    create_log_tables(transaction)?;
    ensure_index_state(transaction)?;
    ensure_schema_version(transaction)
}

fn create_feature_tables(transaction: &Transaction<'_>) -> Result<(), SqliteFeatureStoreError> {
    run_migration_step(
        transaction,
        "create features",
        "CREATE TABLE IF NOT EXISTS features (
            id INTEGER PRIMARY KEY,
            source_id INTEGER NOT NULL,
            geometry TEXT NOT NULL,
            srid INTEGER,
            min_x REAL NOT NULL,
            min_y REAL NOT NULL,
            max_x REAL NOT NULL,
            max_y REAL NOT NULL
        )",
    )?;
    run_migration_step(
        transaction,
        "index features by source",
        "CREATE INDEX IF NOT EXISTS idx_features_source ON features(source_id)",
    )?;
    run_migration_step(
        transaction,
        "create features_staging",
        "CREATE TABLE IF NOT EXISTS features_staging (
            id INTEGER PRIMARY KEY,
            source_id INTEGER NOT NULL,
            geometry TEXT NOT NULL,
            srid INTEGER,
            min_x REAL NOT NULL,
            min_y REAL NOT NULL,
            max_x REAL NOT NULL,
            max_y REAL NOT NULL
        )",
    )?;
    run_migration_step(
        transaction,
        "create features_rtree",
        "CREATE VIRTUAL TABLE IF NOT EXISTS features_rtree USING rtree(
            id,
            min_x, max_x,
            min_y, max_y
        )",
    )
}

fn create_log_tables(transaction: &Transaction<'_>) -> Result<(), SqliteFeatureStoreError> {
    run_migration_step(
        transaction,
        "create harvest_errors",
        "CREATE TABLE IF NOT EXISTS harvest_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            error_text TEXT NOT NULL,
            logged_at INTEGER NOT NULL
        )",
    )?;
    run_migration_step(
        transaction,
        "index harvest_errors by source",
        "CREATE INDEX IF NOT EXISTS idx_harvest_errors_source
            ON harvest_errors(source_id, id)",
    )?;
    run_migration_step(
        transaction,
        "create harvest_successes",
        "CREATE TABLE IF NOT EXISTS harvest_successes (
            source_id INTEGER PRIMARY KEY,
            error_watermark INTEGER NOT NULL,
            harvested_at INTEGER NOT NULL
        ) WITHOUT ROWID",
    )?;
    run_migration_step(
        transaction,
        "create staged_harvests",
        "CREATE TABLE IF NOT EXISTS staged_harvests (
            source_id INTEGER PRIMARY KEY,
            error_watermark INTEGER NOT NULL,
            harvested_at INTEGER NOT NULL
        ) WITHOUT ROWID",
    )
}

fn ensure_index_state(transaction: &Transaction<'_>) -> Result<(), SqliteFeatureStoreError> {
    run_migration_step(
        transaction,
        "create spatial_index_state",
        "CREATE TABLE IF NOT EXISTS spatial_index_state (
            singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
            state TEXT NOT NULL CHECK (state IN ('enabled', 'disabled'))
        )",
    )?;
    run_migration_step(
        transaction,
        "seed spatial_index_state",
        "INSERT OR IGNORE INTO spatial_index_state (singleton, state) VALUES (1, 'enabled')",
    )
}

fn ensure_schema_version(transaction: &Transaction<'_>) -> Result<(), SqliteFeatureStoreError> {
    run_migration_step(
        transaction,
        "create schema version table",
        "CREATE TABLE IF NOT EXISTS geoharvest_schema_version (
            version INTEGER PRIMARY KEY CHECK (version > 0),
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        ) WITHOUT ROWID",
    )?;

    let existing_version: Option<i64> = transaction
        .query_row(
            "SELECT version FROM geoharvest_schema_version LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|source| SqliteFeatureStoreError::Migration {
            step: "read schema version",
            source,
        })?;

    match existing_version {
        Some(version) if version == SCHEMA_VERSION => Ok(()),
        Some(found) => Err(SqliteFeatureStoreError::VersionMismatch {
            expected: SCHEMA_VERSION,
            found,
        }),
        None => transaction
            .execute(
                "INSERT INTO geoharvest_schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )
            .map(|_| ())
            .map_err(|source| SqliteFeatureStoreError::Migration {
                step: "record schema version",
                source,
            }),
    }
}

fn run_migration_step(
    transaction: &Transaction<'_>,
    step: &'static str,
    sql: &str,
) -> Result<(), SqliteFeatureStoreError> {
    transaction
        .execute(sql, [])
        .map(|_| ())
        .map_err(|source| SqliteFeatureStoreError::Migration { step, source })
}
