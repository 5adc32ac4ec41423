//! Connection setup and table definitions

use super::StoreConfig;
use crate::{BucketWidths, Result, ThermoError, ViewRange};
use rusqlite::{params, Connection, OpenFlags};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Schema version stored in `PRAGMA user_version`
const SCHEMA_VERSION: i64 = 2;

// The samples primary key leads with time_ms, which doubles as the global
// time index used by date_span().
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS samples (
    time_ms INTEGER NOT NULL,
    sensor  TEXT    NOT NULL,
    metric  INTEGER NOT NULL,
    value   REAL    NOT NULL,
    PRIMARY KEY (time_ms, sensor, metric)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_samples_sensor_time ON samples (sensor, time_ms);

CREATE TABLE IF NOT EXISTS rollups (
    bucket_ms  INTEGER NOT NULL,
    sensor     TEXT    NOT NULL,
    view_range TEXT    NOT NULL,
    metric     INTEGER NOT NULL,
    avg        REAL,
    min        REAL,
    max        REAL,
    PRIMARY KEY (bucket_ms, sensor, view_range, metric)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_rollups_sensor_view_time
    ON rollups (sensor, view_range, bucket_ms);

CREATE TABLE IF NOT EXISTS series (
    sensor TEXT    NOT NULL,
    metric INTEGER NOT NULL,
    PRIMARY KEY (sensor, metric)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS bucket_widths (
    view_range TEXT    NOT NULL PRIMARY KEY,
    width_ms   INTEGER NOT NULL
) WITHOUT ROWID;
"#;

/// Open the writer connection, creating the database and schema if absent
pub(crate) fn open_writer(config: &StoreConfig) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(&config.path, flags)?;
    conn.busy_timeout(config.busy_timeout)?;

    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        warn!("Database {:?} runs in {} journal mode, readers may block", config.path, mode);
    }
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;

    initialize(&conn)?;
    Ok(conn)
}

/// Open a reader connection on an existing database
pub(crate) fn open_reader(config: &StoreConfig) -> Result<Connection> {
    // Readers need write access for fill-on-read, but never create the file.
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(&config.path, flags)?;
    conn.busy_timeout(config.busy_timeout)?;
    check_version(&conn)?;
    Ok(conn)
}

fn initialize(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    match version {
        0 => {
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            debug!("Created schema version {}", SCHEMA_VERSION);
            Ok(())
        }
        // Version 1 had no bucket_widths table; the writer fills it in and
        // rebuilds rollups whose width it cannot vouch for
        1 => {
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            info!("Upgraded schema from version 1 to {}", SCHEMA_VERSION);
            Ok(())
        }
        SCHEMA_VERSION => {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        }
        other => Err(ThermoError::Corruption(format!(
            "unsupported schema version {other}, expected {SCHEMA_VERSION}"
        ))),
    }
}

fn check_version(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version != SCHEMA_VERSION {
        return Err(ThermoError::Corruption(format!(
            "database schema version {version}, expected {SCHEMA_VERSION} (open a writer first)"
        )));
    }
    Ok(())
}

/// Bucket width each view range's cached rollups were computed with
pub(crate) fn stored_widths(conn: &Connection) -> Result<BTreeMap<ViewRange, i64>> {
    let mut stmt = conn.prepare_cached("SELECT view_range, width_ms FROM bucket_widths")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

    let mut widths = BTreeMap::new();
    for row in rows {
        let (view, width) = row?;
        widths.insert(view.parse::<ViewRange>()?, width);
    }
    Ok(widths)
}

pub(crate) fn store_width(conn: &Connection, view: ViewRange, width_ms: i64) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO bucket_widths (view_range, width_ms) VALUES (?1, ?2)
         ON CONFLICT (view_range) DO UPDATE SET width_ms = excluded.width_ms",
    )?
    .execute(params![view.as_str(), width_ms])?;
    Ok(())
}

/// View ranges whose cached rollups were not computed with `widths`
pub(crate) fn width_mismatches(conn: &Connection, widths: &BucketWidths) -> Result<Vec<ViewRange>> {
    let stored = stored_widths(conn)?;
    Ok(ViewRange::ALL
        .into_iter()
        .filter(|view| stored.get(view) != Some(&widths.width_ms(*view)))
        .collect())
}

/// Bucket widths recorded in the database at `config.path`, without
/// creating or upgrading anything
pub(crate) fn peek_widths(config: &StoreConfig) -> Result<BTreeMap<ViewRange, i64>> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(&config.path, flags)?;
    conn.busy_timeout(config.busy_timeout)?;

    let tables: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'bucket_widths'",
        [],
        |row| row.get(0),
    )?;
    if tables == 0 {
        return Ok(BTreeMap::new());
    }
    stored_widths(&conn)
}

/// Refuse to serve rollups computed with other bucket widths
pub(crate) fn check_widths(conn: &Connection, widths: &BucketWidths) -> Result<()> {
    let stored = stored_widths(conn)?;
    let mismatch = ViewRange::ALL
        .into_iter()
        .find(|view| stored.get(view) != Some(&widths.width_ms(*view)));

    match mismatch {
        None => Ok(()),
        Some(view) => {
            let found = match stored.get(&view) {
                Some(ms) => format!("{ms}ms"),
                None => "unknown".to_string(),
            };
            Err(ThermoError::Config(format!(
                "{view} buckets are {found} wide in the store but {}ms are configured; \
                 open a writer with this configuration to rebuild them",
                widths.width_ms(view)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_writer_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::at(temp_dir.path().join("t.db"));

        drop(open_writer(&config).unwrap());
        let conn = open_writer(&config).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_width_mismatches() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::at(temp_dir.path().join("t.db"));
        let conn = open_writer(&config).unwrap();
        let widths = BucketWidths::default();

        assert_eq!(width_mismatches(&conn, &widths).unwrap(), ViewRange::ALL.to_vec());
        assert!(matches!(check_widths(&conn, &widths), Err(ThermoError::Config(_))));

        for view in ViewRange::ALL {
            store_width(&conn, view, widths.width_ms(view)).unwrap();
        }
        assert!(width_mismatches(&conn, &widths).unwrap().is_empty());
        check_widths(&conn, &widths).unwrap();

        let mut coarser = widths;
        coarser.month = std::time::Duration::from_secs(6 * 3600);
        assert_eq!(width_mismatches(&conn, &coarser).unwrap(), vec![ViewRange::Month]);
        let err = check_widths(&conn, &coarser).unwrap_err().to_string();
        assert!(err.contains("month"), "{err}");
    }

    #[test]
    fn test_upgrades_version_one() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::at(temp_dir.path().join("t.db"));
        {
            let conn = open_writer(&config).unwrap();
            conn.execute_batch("DROP TABLE bucket_widths; PRAGMA user_version = 1;")
                .unwrap();
        }
        let conn = open_writer(&config).unwrap();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        assert!(stored_widths(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_reader_requires_existing_database() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::at(temp_dir.path().join("missing.db"));
        assert!(open_reader(&config).is_err());

        open_writer(&config).unwrap();
        assert!(open_reader(&config).is_ok());
    }

    #[test]
    fn test_rejects_future_schema() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::at(temp_dir.path().join("t.db"));
        {
            let conn = open_writer(&config).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }
        assert!(matches!(open_writer(&config), Err(ThermoError::Corruption(_))));
    }
}
