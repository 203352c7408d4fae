//! SQLite-backed feature store with an R\*Tree spatial index.
//!
//! Geometries are stored as WKT alongside their envelope. The
//! `features_rtree` virtual table is the spatial index; it is emptied when
//! the index is disabled and repopulated from the stored envelopes when it
//! is rebuilt.
//!
//! Disabling the index opens an exclusive transaction that stays open until
//! the rebuild commits it. Every write in between runs in a savepoint of
//! that transaction, so other connections can neither write nor start a
//! window of their own until the rebuild, and a process that dies inside
//! the window leaves the previous committed state behind. File databases
//! use write-ahead logging, so readers on other connections keep seeing
//! that committed state throughout.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8};
use geo::{Intersects, Rect};
use log::{debug, warn};
use rusqlite::{Connection, ErrorCode, TransactionBehavior};
use thiserror::Error;

use super::{IndexState, MergeSummary, SpatialStore, WGS84_SRID, schema};
use crate::{CanonicalGeometry, Feature, GeometryError, HarvestErrorLogEntry, SourceId, unix_now};

/// Error raised by [`SqliteFeatureStore`].
#[derive(Debug, Error)]
pub enum SqliteFeatureStoreError {
    /// Failed to create the parent directory for the database file.
    #[error("failed to create parent directory {path:?}")]
    CreateDirectory {
        /// Directory that could not be created.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Opening the SQLite database failed.
    #[error("failed to open SQLite database at {path:?}")]
    Open {
        /// Database location.
        path: Utf8PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// A schema migration step failed.
    #[error("failed to execute migration step '{step}'")]
    Migration {
        /// Name of the failing step.
        step: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// The database was created by an incompatible release.
    #[error("expected feature store schema version {expected} but found {found}")]
    VersionMismatch {
        /// Version this build understands.
        expected: i64,
        /// Version recorded in the database.
        found: i64,
    },
    /// A store operation failed.
    #[error("failed to {operation}")]
    Sqlite {
        /// Description of the failing operation.
        operation: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// Another connection holds the spatial index window.
    #[error("spatial index is held by another connection; retry once its rebuild finishes")]
    IndexLocked,
    /// Envelope query issued while the spatial index is disabled.
    #[error("spatial index is disabled; envelope queries are unavailable")]
    IndexDisabled,
    /// The persisted index state was not recognised.
    #[error("unrecognised spatial index state {state:?}")]
    InvalidIndexState {
        /// Persisted value.
        state: String,
    },
    /// A source identifier does not fit in an SQLite integer.
    #[error("source id {source_id} exceeds SQLite i64 range")]
    SourceIdOutOfRange {
        /// Identifier that failed the conversion.
        source_id: u64,
    },
    /// A persisted source identifier was negative.
    #[error("stored source id {value} is negative")]
    NegativeSourceId {
        /// Persisted value.
        value: i64,
    },
    /// A persisted geometry could not be decoded.
    #[error("stored geometry for feature {id} is invalid")]
    InvalidGeometry {
        /// Row identifier.
        id: i64,
        /// Decoding failure.
        #[source]
        source: GeometryError,
    },
}

fn sql(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> SqliteFeatureStoreError {
    move |source| SqliteFeatureStoreError::Sqlite { operation, source }
}

/// Feature store persisted in a SQLite database.
#[derive(Debug)]
pub struct SqliteFeatureStore {
    connection: Connection,
}

impl SqliteFeatureStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// Parent directories are created automatically, the database is
    /// switched to write-ahead logging and the schema is initialised
    /// idempotently.
    pub fn open(path: &Utf8Path) -> Result<Self, SqliteFeatureStoreError> {
        ensure_parent_dir(path)?;
        let open_error = |source| SqliteFeatureStoreError::Open {
            path: path.to_path_buf(),
            source,
        };
        let connection = Connection::open(path.as_std_path()).map_err(open_error)?;
        let mode: String = connection
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(open_error)?;
        debug!("opened {path} in {mode} journal mode");
        Self::with_connection(connection)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, SqliteFeatureStoreError> {
        let connection =
            Connection::open_in_memory().map_err(|source| SqliteFeatureStoreError::Open {
                path: Utf8PathBuf::from(":memory:"),
                source,
            })?;
        Self::with_connection(connection)
    }

    fn with_connection(mut connection: Connection) -> Result<Self, SqliteFeatureStoreError> {
        // A current schema needs no write lock, so opening works while another
        // connection holds the index window.
        if schema::is_current(&connection)? {
            return Ok(Self { connection });
        }
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| SqliteFeatureStoreError::Migration {
                step: "begin schema transaction",
                source,
            })?;
        schema::initialise(&transaction)?;
        transaction
            .commit()
            .map_err(|source| SqliteFeatureStoreError::Migration {
                step: "commit schema transaction",
                source,
            })?;
        Ok(Self { connection })
    }

    /// Whether this connection holds an open index window.
    fn in_window(&self) -> bool {
        !self.connection.is_autocommit()
    }

    /// Run `body` atomically: in a savepoint inside an open index window,
    /// otherwise in its own immediate transaction.
    fn write<T>(
        &mut self,
        commit: &'static str,
        body: impl FnOnce(&Connection) -> Result<T, SqliteFeatureStoreError>,
    ) -> Result<T, SqliteFeatureStoreError> {
        if self.in_window() {
            let savepoint = self
                .connection
                .savepoint()
                .map_err(sql("open savepoint"))?;
            let value = body(&*savepoint)?;
            savepoint.commit().map_err(sql(commit))?;
            Ok(value)
        } else {
            let transaction = self
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql("begin transaction"))?;
            let value = body(&*transaction)?;
            transaction.commit().map_err(sql(commit))?;
            Ok(value)
        }
    }

    fn open_window(&mut self) -> Result<(), SqliteFeatureStoreError> {
        self.connection
            .execute_batch("BEGIN EXCLUSIVE")
            .map_err(|source| {
                if source.sqlite_error_code() == Some(ErrorCode::DatabaseBusy) {
                    SqliteFeatureStoreError::IndexLocked
                } else {
                    SqliteFeatureStoreError::Sqlite {
                        operation: "open spatial index window",
                        source,
                    }
                }
            })
    }

    fn abandon_window(&mut self) {
        if let Err(err) = self.connection.execute_batch("ROLLBACK") {
            warn!("failed to roll back spatial index window: {err}");
        }
    }
}

fn ensure_parent_dir(path: &Utf8Path) -> Result<(), SqliteFeatureStoreError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_str().is_empty() || parent == Utf8Path::new("/") {
        return Ok(());
    }

    let (base, relative) = if parent.is_absolute() {
        ("/", parent.strip_prefix("/").unwrap_or(parent))
    } else {
        (".", parent)
    };
    let directory_error = |source| SqliteFeatureStoreError::CreateDirectory {
        path: parent.to_path_buf(),
        source,
    };
    fs_utf8::Dir::open_ambient_dir(base, ambient_authority())
        .map_err(directory_error)?
        .create_dir_all(relative)
        .map_err(directory_error)
}

fn to_sql_id(source: SourceId) -> Result<i64, SqliteFeatureStoreError> {
    i64::try_from(source.0).map_err(|_| SqliteFeatureStoreError::SourceIdOutOfRange {
        source_id: source.0,
    })
}

fn from_sql_id(value: i64) -> Result<SourceId, SqliteFeatureStoreError> {
    u64::try_from(value)
        .map(SourceId)
        .map_err(|_| SqliteFeatureStoreError::NegativeSourceId { value })
}

fn decode(id: i64, wkt: &str) -> Result<CanonicalGeometry, SqliteFeatureStoreError> {
    CanonicalGeometry::from_wkt(wkt)
        .map_err(|source| SqliteFeatureStoreError::InvalidGeometry { id, source })
}

fn read_index_state(connection: &Connection) -> Result<IndexState, SqliteFeatureStoreError> {
    let state: String = connection
        .query_row(
            "SELECT state FROM spatial_index_state WHERE singleton = 1",
            [],
            |row| row.get(0),
        )
        .map_err(sql("read spatial index state"))?;
    match state.as_str() {
        "enabled" => Ok(IndexState::Enabled),
        "disabled" => Ok(IndexState::Disabled),
        _ => Err(SqliteFeatureStoreError::InvalidIndexState { state }),
    }
}

fn write_index_state(
    connection: &Connection,
    state: IndexState,
) -> Result<(), SqliteFeatureStoreError> {
    connection
        .execute(
            "UPDATE spatial_index_state SET state = ?1 WHERE singleton = 1",
            [state.as_str()],
        )
        .map(|_| ())
        .map_err(sql("update spatial index state"))
}

fn empty_index(connection: &Connection) -> Result<(), SqliteFeatureStoreError> {
    connection
        .execute("DELETE FROM features_rtree", [])
        .map(|_| ())
        .map_err(sql("empty spatial index"))
}

/// Insert rows into `table`, keeping the R\*Tree in step when `indexed`.
fn insert_rows(
    connection: &Connection,
    table: Table,
    source: SourceId,
    geometries: &[CanonicalGeometry],
    indexed: bool,
) -> Result<usize, SqliteFeatureStoreError> {
    let source_id = to_sql_id(source)?;
    let mut insert = connection
        .prepare_cached(table.insert_sql())
        .map_err(sql("prepare feature insert"))?;
    let mut index = connection
        .prepare_cached(
            "INSERT INTO features_rtree (id, min_x, max_x, min_y, max_y)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_err(sql("prepare index insert"))?;
    for geometry in geometries {
        let envelope = geometry.envelope();
        let (min, max) = (envelope.min(), envelope.max());
        insert
            .execute((source_id, geometry.to_wkt(), min.x, min.y, max.x, max.y))
            .map_err(sql("insert feature"))?;
        if indexed {
            index
                .execute((connection.last_insert_rowid(), min.x, max.x, min.y, max.y))
                .map_err(sql("insert index entry"))?;
        }
    }
    Ok(geometries.len())
}

/// Repair every staged row in place, deleting those that cannot be
/// repaired. Returns the number deleted.
fn repair_staged_rows(connection: &Connection) -> Result<usize, SqliteFeatureStoreError> {
    let rows: Vec<(i64, String)> = {
        let mut statement = connection
            .prepare("SELECT id, geometry FROM features_staging ORDER BY id")
            .map_err(sql("prepare staging scan"))?;
        statement
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(sql("scan staging"))?
            .collect::<Result<_, _>>()
            .map_err(sql("read staged row"))?
    };

    let mut update = connection
        .prepare_cached(
            "UPDATE features_staging
             SET geometry = ?2, srid = ?3, min_x = ?4, min_y = ?5, max_x = ?6, max_y = ?7
             WHERE id = ?1",
        )
        .map_err(sql("prepare staging repair"))?;
    let mut delete = connection
        .prepare_cached("DELETE FROM features_staging WHERE id = ?1")
        .map_err(sql("prepare staging discard"))?;
    let mut discarded = 0;
    for (id, wkt) in rows {
        match CanonicalGeometry::from_wkt(&wkt).and_then(|geometry| geometry.repaired()) {
            Ok(geometry) => {
                let envelope = geometry.envelope();
                let (min, max) = (envelope.min(), envelope.max());
                update
                    .execute((
                        id,
                        geometry.to_wkt(),
                        WGS84_SRID,
                        min.x,
                        min.y,
                        max.x,
                        max.y,
                    ))
                    .map_err(sql("repair staged row"))?;
            }
            Err(err) => {
                debug!("discarding staged feature {id}: {err}");
                delete.execute([id]).map_err(sql("discard staged row"))?;
                discarded += 1;
            }
        }
    }
    Ok(discarded)
}

/// Replace the live rows of every staged source and promote their staged
/// success watermarks.
fn merge_staged_rows(
    connection: &Connection,
    indexed: bool,
) -> Result<MergeSummary, SqliteFeatureStoreError> {
    let source_ids: Vec<i64> = {
        let mut statement = connection
            .prepare("SELECT DISTINCT source_id FROM features_staging ORDER BY source_id")
            .map_err(sql("prepare staged source scan"))?;
        statement
            .query_map([], |row| row.get(0))
            .map_err(sql("scan staged sources"))?
            .collect::<Result<_, _>>()
            .map_err(sql("read staged source"))?
    };
    let sources = source_ids
        .into_iter()
        .map(from_sql_id)
        .collect::<Result<Vec<_>, _>>()?;

    connection
        .execute(
            "DELETE FROM features_rtree WHERE id IN (
                SELECT id FROM features
                WHERE source_id IN (SELECT source_id FROM features_staging))",
            [],
        )
        .map_err(sql("remove replaced index entries"))?;
    let deleted = connection
        .execute(
            "DELETE FROM features
             WHERE source_id IN (SELECT source_id FROM features_staging)",
            [],
        )
        .map_err(sql("delete replaced features"))?;
    let copied = connection
        .execute(
            "INSERT INTO features (source_id, geometry, srid, min_x, min_y, max_x, max_y)
             SELECT source_id, geometry, srid, min_x, min_y, max_x, max_y
             FROM features_staging ORDER BY id",
            [],
        )
        .map_err(sql("copy staged features"))?;
    if indexed {
        connection
            .execute(
                "INSERT INTO features_rtree (id, min_x, max_x, min_y, max_y)
                 SELECT id, min_x, max_x, min_y, max_y FROM features
                 WHERE source_id IN (SELECT source_id FROM features_staging)",
                [],
            )
            .map_err(sql("index merged features"))?;
    }
    connection
        .execute(
            "INSERT INTO harvest_successes (source_id, error_watermark, harvested_at)
             SELECT source_id, error_watermark, harvested_at FROM staged_harvests
             WHERE source_id IN (SELECT source_id FROM features_staging)
             ON CONFLICT(source_id) DO UPDATE SET
                error_watermark = MAX(error_watermark, excluded.error_watermark),
                harvested_at = MAX(harvested_at, excluded.harvested_at)",
            [],
        )
        .map_err(sql("record merged harvest successes"))?;

    Ok(MergeSummary {
        sources,
        deleted,
        copied,
        discarded: 0,
    })
}

#[derive(Debug, Clone, Copy)]
enum Table {
    Live,
    Staging,
}

impl Table {
    const fn insert_sql(self) -> &'static str {
        match self {
            Self::Live => {
                "INSERT INTO features (source_id, geometry, min_x, min_y, max_x, max_y)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            }
            Self::Staging => {
                "INSERT INTO features_staging (source_id, geometry, min_x, min_y, max_x, max_y)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            }
        }
    }
}

impl SpatialStore for SqliteFeatureStore {
    type Error = SqliteFeatureStoreError;

    fn index_state(&self) -> Result<IndexState, Self::Error> {
        read_index_state(&self.connection)
    }

    /// Opens the exclusive index window unless this connection already
    /// holds it. Fails with [`SqliteFeatureStoreError::IndexLocked`] when
    /// another connection holds it past the busy timeout.
    fn disable_spatial_index(&mut self) -> Result<(), Self::Error> {
        let opened = !self.in_window();
        if opened {
            self.open_window()?;
        }
        let disabled = self.write("commit index disable", |connection| {
            empty_index(connection)?;
            write_index_state(connection, IndexState::Disabled)
        });
        if disabled.is_err() && opened {
            self.abandon_window();
        }
        disabled
    }

    /// Rebuilds the index and commits the open index window, if any.
    fn rebuild_spatial_index(&mut self) -> Result<(), Self::Error> {
        let indexed = self.write("commit index rebuild", |connection| {
            connection
                .execute("UPDATE features SET srid = ?1", [WGS84_SRID])
                .map_err(sql("assign spatial reference"))?;
            empty_index(connection)?;
            let indexed = connection
                .execute(
                    "INSERT INTO features_rtree (id, min_x, max_x, min_y, max_y)
                     SELECT id, min_x, max_x, min_y, max_y FROM features",
                    [],
                )
                .map_err(sql("populate spatial index"))?;
            write_index_state(connection, IndexState::Enabled)?;
            Ok(indexed)
        })?;
        if self.in_window() {
            self.connection
                .execute_batch("COMMIT")
                .map_err(sql("commit spatial index window"))?;
        }
        debug!("spatial index holds {indexed} entries");
        Ok(())
    }

    fn clear_features(&mut self) -> Result<usize, Self::Error> {
        self.write("commit feature clear", |connection| {
            empty_index(connection)?;
            connection
                .execute("DELETE FROM features", [])
                .map_err(sql("clear features"))
        })
    }

    fn insert_features(
        &mut self,
        source: SourceId,
        geometries: &[CanonicalGeometry],
    ) -> Result<usize, Self::Error> {
        let indexed = self.index_state()? == IndexState::Enabled;
        self.write("commit feature insert", |connection| {
            insert_rows(connection, Table::Live, source, geometries, indexed)
        })
    }

    fn truncate_staging(&mut self) -> Result<(), Self::Error> {
        self.write("commit staging truncate", |connection| {
            connection
                .execute_batch("DELETE FROM features_staging; DELETE FROM staged_harvests;")
                .map_err(sql("truncate staging"))
        })
    }

    fn stage_features(
        &mut self,
        source: SourceId,
        geometries: &[CanonicalGeometry],
    ) -> Result<usize, Self::Error> {
        let source_id = to_sql_id(source)?;
        self.write("commit staging insert", |connection| {
            connection
                .execute(
                    "DELETE FROM features_staging WHERE source_id = ?1",
                    [source_id],
                )
                .map_err(sql("remove previously staged rows"))?;
            let staged = insert_rows(connection, Table::Staging, source, geometries, false)?;
            connection
                .execute(
                    "INSERT INTO staged_harvests (source_id, error_watermark, harvested_at)
                     VALUES (?1, COALESCE((SELECT MAX(id) FROM harvest_errors), 0), ?2)
                     ON CONFLICT(source_id) DO UPDATE SET
                        error_watermark = excluded.error_watermark,
                        harvested_at = excluded.harvested_at",
                    (source_id, unix_now()),
                )
                .map_err(sql("record staged harvest"))?;
            Ok(staged)
        })
    }

    fn prepare_staging(&mut self) -> Result<usize, Self::Error> {
        self.write("commit staging repair", repair_staged_rows)
    }

    fn merge_staging(&mut self) -> Result<MergeSummary, Self::Error> {
        let indexed = self.index_state()? == IndexState::Enabled;
        self.write("commit staging merge", |connection| {
            merge_staged_rows(connection, indexed)
        })
    }

    fn features_for_source(
        &self,
        source: SourceId,
    ) -> Result<Vec<CanonicalGeometry>, Self::Error> {
        let source_id = to_sql_id(source)?;
        let mut statement = self
            .connection
            .prepare_cached("SELECT id, geometry FROM features WHERE source_id = ?1 ORDER BY id")
            .map_err(sql("prepare source scan"))?;
        let rows: Vec<(i64, String)> = statement
            .query_map([source_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(sql("scan source features"))?
            .collect::<Result<_, _>>()
            .map_err(sql("read source feature"))?;
        rows.iter().map(|(id, wkt)| decode(*id, wkt)).collect()
    }

    fn features_in_envelope(&self, bbox: &Rect<f64>) -> Result<Vec<Feature>, Self::Error> {
        if self.index_state()? == IndexState::Disabled {
            return Err(SqliteFeatureStoreError::IndexDisabled);
        }
        let (min, max) = (bbox.min(), bbox.max());
        let mut statement = self
            .connection
            .prepare_cached(
                "SELECT f.id, f.source_id, f.geometry
                 FROM features_rtree AS r
                 JOIN features AS f ON f.id = r.id
                 WHERE r.min_x <= ?3 AND r.max_x >= ?1 AND r.min_y <= ?4 AND r.max_y >= ?2
                 ORDER BY f.id",
            )
            .map_err(sql("prepare envelope query"))?;
        let rows: Vec<(i64, i64, String)> = statement
            .query_map((min.x, min.y, max.x, max.y), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(sql("run envelope query"))?
            .collect::<Result<_, _>>()
            .map_err(sql("read envelope match"))?;

        let mut features = Vec::with_capacity(rows.len());
        for (id, source_id, wkt) in rows {
            let geometry = decode(id, &wkt)?;
            // The R*Tree stores rounded-out single-precision bounds.
            if bbox.intersects(&geometry.envelope()) {
                features.push(Feature {
                    source_id: from_sql_id(source_id)?,
                    geometry,
                });
            }
        }
        Ok(features)
    }

    fn feature_counts(&self) -> Result<BTreeMap<SourceId, usize>, Self::Error> {
        let mut statement = self
            .connection
            .prepare_cached(
                "SELECT source_id, COUNT(*) FROM features GROUP BY source_id ORDER BY source_id",
            )
            .map_err(sql("prepare feature count"))?;
        let rows: Vec<(i64, i64)> = statement
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(sql("count features"))?
            .collect::<Result<_, _>>()
            .map_err(sql("read feature count"))?;
        rows.into_iter()
            .map(|(source_id, count)| {
                Ok((
                    from_sql_id(source_id)?,
                    usize::try_from(count).unwrap_or_default(),
                ))
            })
            .collect()
    }

    fn log_harvest_error(&mut self, entry: &HarvestErrorLogEntry) -> Result<(), Self::Error> {
        let source_id = to_sql_id(entry.source_id)?;
        self.connection
            .execute(
                "INSERT INTO harvest_errors (source_id, error_text, logged_at) VALUES (?1, ?2, ?3)",
                (source_id, entry.message.as_str(), entry.logged_at),
            )
            .map(|_| ())
            .map_err(sql("log harvest error"))
    }

    fn record_harvest_success(&mut self, source: SourceId) -> Result<(), Self::Error> {
        let source_id = to_sql_id(source)?;
        self.connection
            .execute(
                "INSERT INTO harvest_successes (source_id, error_watermark, harvested_at)
                 VALUES (?1, COALESCE((SELECT MAX(id) FROM harvest_errors), 0), ?2)
                 ON CONFLICT(source_id) DO UPDATE SET
                    error_watermark = excluded.error_watermark,
                    harvested_at = excluded.harvested_at",
                (source_id, unix_now()),
            )
            .map(|_| ())
            .map_err(sql("record harvest success"))
    }

    fn unresolved_errors(&self) -> Result<Vec<HarvestErrorLogEntry>, Self::Error> {
        let mut statement = self
            .connection
            .prepare_cached(
                "SELECT e.source_id, e.error_text, e.logged_at
                 FROM harvest_errors AS e
                 WHERE e.id = (SELECT MAX(id) FROM harvest_errors WHERE source_id = e.source_id)
                   AND e.id > COALESCE(
                       (SELECT error_watermark FROM harvest_successes AS s
                        WHERE s.source_id = e.source_id),
                       0)
                 ORDER BY e.source_id",
            )
            .map_err(sql("prepare unresolved error query"))?;
        let rows: Vec<(i64, String, i64)> = statement
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(sql("query unresolved errors"))?
            .collect::<Result<_, _>>()
            .map_err(sql("read unresolved error"))?;
        rows.into_iter()
            .map(|(source_id, message, logged_at)| {
                Ok(HarvestErrorLogEntry {
                    source_id: from_sql_id(source_id)?,
                    message,
                    logged_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use geo::Coord;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    fn geometry(wkt: &str) -> CanonicalGeometry {
        CanonicalGeometry::from_wkt(wkt).expect("valid WKT")
    }

    #[fixture]
    fn store() -> SqliteFeatureStore {
        SqliteFeatureStore::open_in_memory().expect("open in-memory store")
    }

    fn raw_count(store: &SqliteFeatureStore, table: &str) -> i64 {
        store
            .connection
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .expect("count rows")
    }

    #[rstest]
    fn opens_nested_path_and_reopens(#[from(temp_dir)] dir: TempDir) {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("nested/dir/features.db"))
            .expect("utf-8 path");
        {
            let mut store = SqliteFeatureStore::open(&path).expect("create store");
            store
                .insert_features(SourceId(1), &[geometry("POINT(1 2)")])
                .expect("insert");
        }
        let reopened = SqliteFeatureStore::open(&path).expect("reopen store");
        assert_eq!(
            reopened.features_for_source(SourceId(1)).expect("features"),
            vec![geometry("POINT(1 2)")]
        );
    }

    #[fixture]
    fn temp_dir() -> TempDir {
        TempDir::new().expect("create temp dir")
    }

    #[rstest]
    fn rejects_future_schema_version(#[from(temp_dir)] dir: TempDir) {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("features.db")).expect("utf-8 path");
        drop(SqliteFeatureStore::open(&path).expect("create store"));
        Connection::open(path.as_std_path())
            .expect("open raw")
            .execute("UPDATE geoharvest_schema_version SET version = 99", [])
            .expect("bump version");

        let err = SqliteFeatureStore::open(&path).expect_err("version mismatch");
        assert!(matches!(
            err,
            SqliteFeatureStoreError::VersionMismatch {
                expected: schema::SCHEMA_VERSION,
                found: 99
            }
        ));
    }

    #[rstest]
    fn disable_empties_index_and_rebuild_assigns_srid(mut store: SqliteFeatureStore) {
        store
            .insert_features(SourceId(1), &[geometry("POINT(1 1)"), geometry("POINT(2 2)")])
            .expect("insert");
        assert_eq!(raw_count(&store, "features_rtree"), 2);

        store.disable_spatial_index().expect("disable");
        assert_eq!(store.index_state().expect("state"), IndexState::Disabled);
        assert_eq!(raw_count(&store, "features_rtree"), 0);

        store.rebuild_spatial_index().expect("rebuild");
        assert_eq!(store.index_state().expect("state"), IndexState::Enabled);
        assert_eq!(raw_count(&store, "features_rtree"), 2);
        let unassigned: i64 = store
            .connection
            .query_row(
                "SELECT COUNT(*) FROM features WHERE srid IS NOT 4326",
                [],
                |row| row.get(0),
            )
            .expect("count unassigned");
        assert_eq!(unassigned, 0);
    }

    #[rstest]
    fn envelope_query_uses_index(mut store: SqliteFeatureStore) {
        store
            .insert_features(
                SourceId(4),
                &[
                    geometry("POLYGON((0 0,2 0,2 2,0 2,0 0))"),
                    geometry("LINESTRING(10 10,12 12)"),
                ],
            )
            .expect("insert");
        let bbox = Rect::new(Coord { x: 1.5, y: 1.5 }, Coord { x: 3.0, y: 3.0 });

        let found = store.features_in_envelope(&bbox).expect("query");

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_id, SourceId(4));
        assert_eq!(found[0].geometry.kind(), crate::GeometryKind::Polygon);
    }

    #[rstest]
    fn envelope_query_refused_while_disabled(mut store: SqliteFeatureStore) {
        store.disable_spatial_index().expect("disable");
        let bbox = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 });
        assert!(matches!(
            store.features_in_envelope(&bbox),
            Err(SqliteFeatureStoreError::IndexDisabled)
        ));
    }

    #[rstest]
    fn prepare_staging_repairs_and_discards(mut store: SqliteFeatureStore) {
        let sliver = CanonicalGeometry::new(geo::Geometry::Polygon(geo::Polygon::new(
            geo::LineString::from(vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }]),
            Vec::new(),
        )))
        .expect("non-empty sliver");
        store.truncate_staging().expect("truncate");
        store
            .stage_features(
                SourceId(9),
                &[geometry("POLYGON((0 0,0 1,1 1,1 0,0 0))"), sliver],
            )
            .expect("stage");

        let discarded = store.prepare_staging().expect("prepare");

        assert_eq!(discarded, 1);
        assert_eq!(raw_count(&store, "features_staging"), 1);
        let srid: Option<i64> = store
            .connection
            .query_row("SELECT srid FROM features_staging", [], |row| row.get(0))
            .expect("read srid");
        assert_eq!(srid, Some(WGS84_SRID));
    }

    #[rstest]
    fn merge_keeps_untouched_sources(mut store: SqliteFeatureStore) {
        store
            .insert_features(SourceId(3), &vec![geometry("POINT(0 0)"); 5])
            .expect("seed C");
        store.truncate_staging().expect("truncate");
        store
            .stage_features(SourceId(4), &[geometry("POINT(1 1)"), geometry("POINT(2 2)")])
            .expect("stage D");
        store.prepare_staging().expect("prepare");

        store.disable_spatial_index().expect("disable");
        let summary = store.merge_staging().expect("merge");
        store.rebuild_spatial_index().expect("rebuild");

        assert_eq!(summary.sources, vec![SourceId(4)]);
        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.copied, 2);
        let counts = store.feature_counts().expect("counts");
        assert_eq!(counts.get(&SourceId(3)), Some(&5));
        assert_eq!(counts.get(&SourceId(4)), Some(&2));
    }

    #[rstest]
    fn unresolved_errors_track_latest_after_success(mut store: SqliteFeatureStore) {
        for (source, message) in [(1, "first"), (1, "second"), (2, "other")] {
            store
                .log_harvest_error(&HarvestErrorLogEntry {
                    source_id: SourceId(source),
                    message: message.into(),
                    logged_at: 100,
                })
                .expect("log");
        }
        let unresolved = store.unresolved_errors().expect("unresolved");
        let messages: Vec<_> = unresolved.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["second", "other"]);

        store.record_harvest_success(SourceId(2)).expect("success");
        let unresolved = store.unresolved_errors().expect("unresolved");
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].source_id, SourceId(1));
    }

    fn log_error(store: &mut SqliteFeatureStore, source: u64, message: &str) {
        store
            .log_harvest_error(&HarvestErrorLogEntry {
                source_id: SourceId(source),
                message: message.into(),
                logged_at: 100,
            })
            .expect("log");
    }

    fn unresolved_messages(store: &SqliteFeatureStore) -> Vec<String> {
        store
            .unresolved_errors()
            .expect("unresolved")
            .into_iter()
            .map(|entry| entry.message)
            .collect()
    }

    #[rstest]
    fn staged_success_resolves_errors_when_merged(mut store: SqliteFeatureStore) {
        log_error(&mut store, 1, "timeout");
        store.truncate_staging().expect("truncate");
        store
            .stage_features(SourceId(1), &[geometry("POINT(1 1)")])
            .expect("stage");
        assert_eq!(unresolved_messages(&store), vec!["timeout"]);

        store.merge_staging().expect("merge");
        assert!(unresolved_messages(&store).is_empty());
        assert_eq!(raw_count(&store, "staged_harvests"), 1);
        store.truncate_staging().expect("truncate");
        assert_eq!(raw_count(&store, "staged_harvests"), 0);
    }

    #[rstest]
    fn error_after_staging_survives_merge(mut store: SqliteFeatureStore) {
        log_error(&mut store, 1, "timeout");
        store.truncate_staging().expect("truncate");
        store
            .stage_features(SourceId(1), &[geometry("POINT(1 1)")])
            .expect("stage");
        log_error(&mut store, 1, "bad gateway");

        store.merge_staging().expect("merge");
        assert_eq!(unresolved_messages(&store), vec!["bad gateway"]);
    }

    #[rstest]
    fn discarded_staging_records_no_success(mut store: SqliteFeatureStore) {
        log_error(&mut store, 2, "timeout");
        store.truncate_staging().expect("truncate");
        store
            .stage_features(SourceId(2), &[geometry("POINT(2 2)")])
            .expect("stage");
        store.truncate_staging().expect("truncate again");

        store.merge_staging().expect("merge");
        assert_eq!(unresolved_messages(&store), vec!["timeout"]);
    }

    #[rstest]
    fn disabled_window_excludes_other_connections(#[from(temp_dir)] dir: TempDir) {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("features.db")).expect("utf-8 path");
        let mut first = SqliteFeatureStore::open(&path).expect("open first");
        let mut second = SqliteFeatureStore::open(&path).expect("open second");
        second
            .connection
            .busy_timeout(Duration::ZERO)
            .expect("set busy timeout");

        first.disable_spatial_index().expect("disable");
        first.clear_features().expect("clear");
        first
            .insert_features(SourceId(1), &[geometry("POINT(1 1)")])
            .expect("insert");

        assert!(matches!(
            second.disable_spatial_index(),
            Err(SqliteFeatureStoreError::IndexLocked)
        ));
        assert!(
            second
                .insert_features(SourceId(2), &[geometry("POINT(2 2)")])
                .is_err()
        );
        assert_eq!(second.index_state().expect("state"), IndexState::Enabled);
        assert_eq!(first.index_state().expect("state"), IndexState::Disabled);

        first.rebuild_spatial_index().expect("rebuild");
        assert_eq!(
            second.features_for_source(SourceId(1)).expect("features"),
            vec![geometry("POINT(1 1)")]
        );
        second.disable_spatial_index().expect("disable from second");
        second.rebuild_spatial_index().expect("rebuild from second");
        assert_eq!(second.index_state().expect("state"), IndexState::Enabled);
    }

    #[rstest]
    fn abandoned_window_rolls_back(#[from(temp_dir)] dir: TempDir) {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("features.db")).expect("utf-8 path");
        {
            let mut store = SqliteFeatureStore::open(&path).expect("open");
            store
                .insert_features(SourceId(1), &[geometry("POINT(1 1)")])
                .expect("insert");
            store.disable_spatial_index().expect("disable");
            store.clear_features().expect("clear");
            store
                .insert_features(SourceId(1), &[geometry("POINT(9 9)")])
                .expect("insert replacement");
        }

        let reopened = SqliteFeatureStore::open(&path).expect("reopen");
        assert_eq!(reopened.index_state().expect("state"), IndexState::Enabled);
        assert_eq!(
            reopened.features_for_source(SourceId(1)).expect("features"),
            vec![geometry("POINT(1 1)")]
        );
    }

    #[rstest]
    fn holed_polygon_reads_back_unchanged(mut store: SqliteFeatureStore) {
        let polygon = geometry("POLYGON((0 0,10 0,10 10,0 10,0 0),(2 2,4 2,4 4,2 4,2 2))");
        store
            .insert_features(SourceId(1), &[polygon.clone(), geometry("POINT(5 5)")])
            .expect("insert");
        assert_eq!(
            store.features_for_source(SourceId(1)).expect("features"),
            vec![polygon, geometry("POINT(5 5)")]
        );
    }

    #[rstest]
    fn rejects_source_ids_beyond_i64(mut store: SqliteFeatureStore) {
        let err = store
            .insert_features(SourceId(u64::MAX), &[geometry("POINT(0 0)")])
            .expect_err("out of range");
        assert!(matches!(
            err,
            SqliteFeatureStoreError::SourceIdOutOfRange { source_id: u64::MAX }
        ));
    }
}
