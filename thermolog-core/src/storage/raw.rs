//! Raw sample table

use crate::types::{from_millis, to_millis};
use crate::{DateSpan, MetricKind, RawPoint, Result, Sample, StatRow, Timestamp};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

/// Fixed parameters bound ahead of the bucket list in `aggregate`
const AGGREGATE_FIXED_PARAMS: usize = 4;

/// Insert a sample, replacing any previous value under the same key
pub(crate) fn insert(conn: &Connection, sample: &Sample) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO samples (time_ms, sensor, metric, value) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (time_ms, sensor, metric) DO UPDATE SET value = excluded.value",
    )?
    .execute(params![
        to_millis(sample.time),
        sample.sensor,
        sample.metric.code(),
        sample.value.as_f64(),
    ])?;
    Ok(())
}

/// Remember that `sensor` produces `metric`
pub(crate) fn register_series(conn: &Connection, sensor: &str, metric: MetricKind) -> Result<()> {
    conn.prepare_cached("INSERT OR IGNORE INTO series (sensor, metric) VALUES (?1, ?2)")?
        .execute(params![sensor, metric.code()])?;
    Ok(())
}

/// Metrics ever recorded for a sensor, in code order
pub(crate) fn series_metrics(conn: &Connection, sensor: &str) -> Result<Vec<MetricKind>> {
    let mut stmt =
        conn.prepare_cached("SELECT metric FROM series WHERE sensor = ?1 ORDER BY metric")?;
    let codes = stmt
        .query_map(params![sensor], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    codes.into_iter().map(MetricKind::from_code).collect()
}

/// Samples with `from <= time < to`, ascending by time then metric
pub(crate) fn query(
    conn: &Connection,
    sensor: &str,
    from: Timestamp,
    to: Timestamp,
) -> Result<Vec<RawPoint>> {
    let mut stmt = conn.prepare_cached(
        "SELECT time_ms, metric, value FROM samples
         WHERE sensor = ?1 AND time_ms >= ?2 AND time_ms < ?3
         ORDER BY time_ms ASC, metric ASC",
    )?;
    let rows = stmt
        .query_map(params![sensor, to_millis(from), to_millis(to)], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, f64>(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(time_ms, metric, value)| {
            Ok(RawPoint {
                time: from_millis(time_ms)?,
                metric: MetricKind::from_code(metric)?,
                value,
            })
        })
        .collect()
}

/// Most recent sample of one metric for a sensor
pub(crate) fn latest(
    conn: &Connection,
    sensor: &str,
    metric: MetricKind,
) -> Result<Option<RawPoint>> {
    let row = conn
        .prepare_cached(
            "SELECT time_ms, value FROM samples
             WHERE sensor = ?1 AND metric = ?2
             ORDER BY time_ms DESC LIMIT 1",
        )?
        .query_row(params![sensor, metric.code()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })
        .optional()?;

    row.map(|(time_ms, value)| {
        Ok(RawPoint {
            time: from_millis(time_ms)?,
            metric,
            value,
        })
    })
    .transpose()
}

/// First and last sample time across all sensors
pub(crate) fn date_span(conn: &Connection) -> Result<Option<DateSpan>> {
    // min() and max() on the leading primary key column are single index seeks
    let (first, last): (Option<i64>, Option<i64>) = conn
        .prepare_cached("SELECT min(time_ms), max(time_ms) FROM samples")?
        .query_row([], |row| Ok((row.get(0)?, row.get(1)?)))?;

    match (first, last) {
        (Some(first), Some(last)) => Ok(Some(DateSpan {
            first: from_millis(first)?,
            last: from_millis(last)?,
        })),
        _ => Ok(None),
    }
}

/// Every sensor with at least one raw sample
pub(crate) fn sensors(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT sensor FROM samples ORDER BY sensor")?;
    let sensors = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(sensors)
}

/// All sample times of a sensor in milliseconds, ascending
pub(crate) fn sample_times(conn: &Connection, sensor: &str) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT time_ms FROM samples WHERE sensor = ?1 ORDER BY time_ms ASC",
    )?;
    let times = stmt
        .query_map(params![sensor], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(times)
}

/// Aggregate raw samples into the requested buckets
///
/// Returns one row per `(bucket, metric)` that has samples, ordered by bucket
/// then metric. Buckets without samples are absent from the result.
/// `bucket_starts` is split into statements of at most `max_params` bound
/// parameters, each scanning only the time range its own buckets cover.
pub(crate) fn aggregate(
    conn: &Connection,
    sensor: &str,
    width_ms: i64,
    bucket_starts: &[i64],
    max_params: usize,
) -> Result<Vec<StatRow>> {
    let mut buckets = bucket_starts.to_vec();
    buckets.sort_unstable();
    buckets.dedup();

    let batch_size = max_params.saturating_sub(AGGREGATE_FIXED_PARAMS).max(1);
    let mut results = Vec::new();

    for batch in buckets.chunks(batch_size) {
        let (Some(&lo), Some(&hi)) = (batch.first(), batch.last()) else {
            continue;
        };

        let placeholders = (0..batch.len())
            .map(|i| format!("?{}", i + AGGREGATE_FIXED_PARAMS + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT bucket, metric, avg(value), min(value), max(value) FROM (
                 SELECT time_ms - ((time_ms % ?1) + ?1) % ?1 AS bucket, metric, value
                 FROM samples
                 WHERE sensor = ?2 AND time_ms >= ?3 AND time_ms < ?4
             )
             WHERE bucket IN ({placeholders})
             GROUP BY bucket, metric
             ORDER BY bucket, metric"
        );

        let mut values = Vec::with_capacity(batch.len() + AGGREGATE_FIXED_PARAMS);
        values.push(Value::Integer(width_ms));
        values.push(Value::Text(sensor.to_string()));
        values.push(Value::Integer(lo));
        values.push(Value::Integer(hi.saturating_add(width_ms)));
        values.extend(batch.iter().map(|b| Value::Integer(*b)));

        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (bucket, metric, avg, min, max) in rows {
            results.push(StatRow {
                bucket_start: from_millis(bucket)?,
                metric: MetricKind::from_code(metric)?,
                avg,
                min,
                max,
            });
        }
    }

    Ok(results)
}
