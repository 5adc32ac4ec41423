//! Rollup cache table

use super::raw;
use crate::types::{from_millis, to_millis};
use crate::{MetricKind, Result, StatRow, ViewRange};
use rusqlite::{params, Connection};
use std::collections::HashMap;

/// Whether a write may replace an existing cache row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Conflict {
    /// Replace the whole row
    Replace,
    /// Keep whatever is already cached
    Keep,
}

/// Write rollup rows for one sensor and view range
pub(crate) fn upsert(
    conn: &Connection,
    sensor: &str,
    view: ViewRange,
    rows: &[StatRow],
    on_conflict: Conflict,
) -> Result<usize> {
    let sql = match on_conflict {
        Conflict::Replace => {
            "INSERT INTO rollups (bucket_ms, sensor, view_range, metric, avg, min, max)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (bucket_ms, sensor, view_range, metric) DO UPDATE SET
                 avg = excluded.avg, min = excluded.min, max = excluded.max"
        }
        Conflict::Keep => {
            "INSERT INTO rollups (bucket_ms, sensor, view_range, metric, avg, min, max)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (bucket_ms, sensor, view_range, metric) DO NOTHING"
        }
    };

    let mut stmt = conn.prepare_cached(sql)?;
    let mut written = 0;
    for row in rows {
        written += stmt.execute(params![
            to_millis(row.bucket_start),
            sensor,
            view.as_str(),
            row.metric.code(),
            row.avg,
            row.min,
            row.max,
        ])?;
    }
    Ok(written)
}

/// Cached rows with `from_ms <= bucket < to_ms`, ordered by bucket then metric
pub(crate) fn fetch(
    conn: &Connection,
    sensor: &str,
    view: ViewRange,
    from_ms: i64,
    to_ms: i64,
) -> Result<Vec<StatRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT bucket_ms, metric, avg, min, max FROM rollups
         WHERE sensor = ?1 AND view_range = ?2 AND bucket_ms >= ?3 AND bucket_ms < ?4
         ORDER BY bucket_ms ASC, metric ASC",
    )?;
    let rows = stmt
        .query_map(params![sensor, view.as_str(), from_ms, to_ms], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<f64>>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(bucket, metric, avg, min, max)| {
            Ok(StatRow {
                bucket_start: from_millis(bucket)?,
                metric: MetricKind::from_code(metric)?,
                avg,
                min,
                max,
            })
        })
        .collect()
}

/// First and last cached bucket of a sensor at one view range
pub(crate) fn span(conn: &Connection, sensor: &str, view: ViewRange) -> Result<Option<(i64, i64)>> {
    let (first, last): (Option<i64>, Option<i64>) = conn
        .prepare_cached(
            "SELECT MIN(bucket_ms), MAX(bucket_ms) FROM rollups
             WHERE sensor = ?1 AND view_range = ?2",
        )?
        .query_row(params![sensor, view.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(first.zip(last))
}

/// Drop cached rows with `from_ms <= bucket < to_ms`
pub(crate) fn delete_range(
    conn: &Connection,
    sensor: &str,
    view: ViewRange,
    from_ms: i64,
    to_ms: i64,
) -> Result<usize> {
    let deleted = conn
        .prepare_cached(
            "DELETE FROM rollups
             WHERE sensor = ?1 AND view_range = ?2 AND bucket_ms >= ?3 AND bucket_ms < ?4",
        )?
        .execute(params![sensor, view.as_str(), from_ms, to_ms])?;
    Ok(deleted)
}

/// Drop every cached row of a view range, across all sensors
pub(crate) fn delete_view(conn: &Connection, view: ViewRange) -> Result<usize> {
    let deleted = conn
        .prepare_cached("DELETE FROM rollups WHERE view_range = ?1")?
        .execute(params![view.as_str()])?;
    Ok(deleted)
}

/// Recompute rollup rows from raw samples
///
/// Produces exactly one row per requested `(bucket, metric)` pair: the raw
/// aggregate when the bucket has samples, a negative entry otherwise.
pub(crate) fn compute(
    conn: &Connection,
    sensor: &str,
    width_ms: i64,
    wanted: &[(i64, MetricKind)],
    max_params: usize,
) -> Result<Vec<StatRow>> {
    if wanted.is_empty() {
        return Ok(Vec::new());
    }

    let mut buckets: Vec<i64> = wanted.iter().map(|(b, _)| *b).collect();
    buckets.sort_unstable();
    buckets.dedup();

    let computed: HashMap<(i64, MetricKind), StatRow> =
        raw::aggregate(conn, sensor, width_ms, &buckets, max_params)?
            .into_iter()
            .map(|row| ((to_millis(row.bucket_start), row.metric), row))
            .collect();

    wanted
        .iter()
        .map(|&(bucket, metric)| match computed.get(&(bucket, metric)) {
            Some(row) => Ok(*row),
            None => Ok(StatRow::empty(from_millis(bucket)?, metric)),
        })
        .collect()
}

/// Recompute and replace every metric of `sensor` in the given buckets
pub(crate) fn refresh(
    conn: &Connection,
    sensor: &str,
    view: ViewRange,
    width_ms: i64,
    buckets: &[i64],
    max_params: usize,
) -> Result<usize> {
    let metrics = raw::series_metrics(conn, sensor)?;
    let wanted: Vec<(i64, MetricKind)> = buckets
        .iter()
        .flat_map(|b| metrics.iter().map(move |m| (*b, *m)))
        .collect();

    let rows = compute(conn, sensor, width_ms, &wanted, max_params)?;
    upsert(conn, sensor, view, &rows, Conflict::Replace)
}
