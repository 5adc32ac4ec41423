//! Reader - range queries over raw samples and the rollup cache

use super::rollup::{self, Conflict};
use super::{raw, schema, StoreConfig};
use crate::bucket::floor_millis;
use crate::types::{from_millis, to_millis};
use crate::{
    BucketWidths, DateSpan, MetricKind, RawPoint, Result, StatRow, ThermoError, Timestamp,
    ViewRange,
};
use rusqlite::{Connection, TransactionBehavior};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Read handle on the store
///
/// Each reader owns its own connection; open one per thread or request.
/// The only writes a reader performs are rollup rows it had to compute
/// because they were missing from the cache.
pub struct Reader {
    conn: Connection,
    widths: BucketWidths,
    max_query_params: usize,
    max_query_buckets: usize,
}

impl Reader {
    /// Open a reader on an existing store
    ///
    /// Fails with a configuration error when the store's rollups were built
    /// with other bucket widths; opening a [`Writer`](super::Writer) with
    /// `config` rebuilds them.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.widths.validate()?;
        let conn = schema::open_reader(config)?;
        schema::check_widths(&conn, &config.widths)?;
        Ok(Self {
            conn,
            widths: config.widths,
            max_query_params: config.max_query_params,
            max_query_buckets: config.max_query_buckets,
        })
    }

    /// Raw samples of a sensor with `from <= time < to`, ascending
    pub fn get(&self, sensor: &str, from: Timestamp, to: Timestamp) -> Result<Vec<RawPoint>> {
        raw::query(&self.conn, sensor, from, to)
    }

    /// Most recent raw sample of one metric
    pub fn get_latest(&self, sensor: &str, metric: MetricKind) -> Result<Option<RawPoint>> {
        raw::latest(&self.conn, sensor, metric)
    }

    /// Time span covered by raw samples, `None` for an empty store
    pub fn date_span(&self) -> Result<Option<DateSpan>> {
        raw::date_span(&self.conn)
    }

    /// Metrics ever recorded for a sensor
    pub fn metrics(&self, sensor: &str) -> Result<Vec<MetricKind>> {
        raw::series_metrics(&self.conn, sensor)
    }

    /// Default query window for a view range ending at `now`
    ///
    /// `All` spans the stored data; `None` when the store is empty.
    pub fn default_window(
        &self,
        view: ViewRange,
        now: Timestamp,
    ) -> Result<Option<(Timestamp, Timestamp)>> {
        match view.window(now) {
            Some(window) => Ok(Some(window)),
            None => Ok(self.date_span()?.map(|span| (span.first, span.end()))),
        }
    }

    /// Rollup statistics of a sensor over `[from, to)`
    ///
    /// Returns exactly one row per metric of the sensor for every bucket
    /// start in `[from, to)`, ordered by bucket then metric. Buckets missing
    /// from the cache are computed from raw samples and cached; buckets
    /// outside the stored data span are returned empty without touching
    /// the store.
    ///
    /// Windows spanning more than `max_query_buckets` buckets are rejected
    /// with [`ThermoError::TooManyBuckets`].
    pub fn get_stats(
        &mut self,
        sensor: &str,
        from: Timestamp,
        to: Timestamp,
        view: ViewRange,
    ) -> Result<Vec<StatRow>> {
        let width = self.widths.width_ms(view);
        let buckets = self.widths.enumerate(from, to, view);
        let requested = buckets.size_hint().1.unwrap_or(usize::MAX);
        if requested > self.max_query_buckets {
            return Err(ThermoError::TooManyBuckets {
                requested,
                limit: self.max_query_buckets,
            });
        }
        let want: Vec<i64> = buckets.millis().collect();
        if want.is_empty() {
            return Ok(Vec::new());
        }

        let metrics = raw::series_metrics(&self.conn, sensor)?;
        if metrics.is_empty() {
            debug!(sensor, "No series recorded for sensor");
            return Ok(Vec::new());
        }

        let (from_ms, to_ms) = (to_millis(from), to_millis(to));

        // Where raw samples can exist, aligned to whole buckets
        let raw_region = raw::date_span(&self.conn)?.and_then(|span| {
            let first = floor_millis(to_millis(span.first), width);
            clip(first, to_millis(span.end()), from_ms, to_ms)
        });
        // Where cached rows exist, including summaries of purged samples
        let cached_region = rollup::span(&self.conn, sensor, view)?
            .and_then(|(lo, hi)| clip(lo, hi + 1, from_ms, to_ms));

        let wanted_buckets: HashSet<i64> = want.iter().copied().collect();
        let mut rows: Vec<StatRow> = match hull(raw_region, cached_region) {
            Some((lo, hi)) => rollup::fetch(&self.conn, sensor, view, lo, hi)?
                .into_iter()
                .filter(|r| {
                    wanted_buckets.contains(&to_millis(r.bucket_start))
                        && metrics.contains(&r.metric)
                })
                .collect(),
            None => Vec::new(),
        };
        let have: HashSet<(i64, MetricKind)> = rows
            .iter()
            .map(|r| (to_millis(r.bucket_start), r.metric))
            .collect();

        let in_raw_region = |b: i64| matches!(raw_region, Some((lo, hi)) if b >= lo && b < hi);

        let mut missing = Vec::new();
        let mut padded = 0;
        for &bucket in &want {
            for &metric in &metrics {
                if have.contains(&(bucket, metric)) {
                    continue;
                }
                if in_raw_region(bucket) {
                    missing.push((bucket, metric));
                } else {
                    rows.push(StatRow::empty(from_millis(bucket)?, metric));
                    padded += 1;
                }
            }
        }

        debug!(
            sensor,
            view = %view,
            wanted = want.len(),
            cached = have.len(),
            missing = missing.len(),
            padded,
            "Rollup lookup"
        );

        if !missing.is_empty() {
            rows.extend(self.fill(sensor, view, width, &missing)?);
        }

        rows.sort_by(|a, b| {
            a.bucket_start
                .cmp(&b.bucket_start)
                .then_with(|| a.metric.cmp(&b.metric))
        });
        Ok(rows)
    }

    /// Compute missing rollup rows from raw samples and cache them
    ///
    /// Each chunk of at most `max_query_params` pairs commits on its own, so
    /// the write lock is released between chunks and a concurrent writer
    /// only ever waits for one of them. Within a chunk no sample can land in
    /// the buckets between the aggregate and the insert. Rows the writer
    /// cached in the meantime win over ours.
    fn fill(
        &mut self,
        sensor: &str,
        view: ViewRange,
        width: i64,
        missing: &[(i64, MetricKind)],
    ) -> Result<Vec<StatRow>> {
        let mut rows = Vec::with_capacity(missing.len());
        let mut inserted = 0;
        let mut chunks = 0;

        for chunk in missing.chunks(self.max_query_params) {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let computed = rollup::compute(&tx, sensor, width, chunk, self.max_query_params)?;
            inserted += rollup::upsert(&tx, sensor, view, &computed, Conflict::Keep)?;
            tx.commit()?;

            rows.extend(computed);
            chunks += 1;
        }

        let buckets: BTreeSet<i64> = missing.iter().map(|(b, _)| *b).collect();
        debug!(
            sensor,
            view = %view,
            buckets = buckets.len(),
            chunks,
            inserted,
            "Filled rollup gap from raw samples"
        );
        Ok(rows)
    }
}

/// Intersection of `[lo, hi)` with `[from, to)`
fn clip(lo: i64, hi: i64, from: i64, to: i64) -> Option<(i64, i64)> {
    let (start, end) = (lo.max(from), hi.min(to));
    (start < end).then_some((start, end))
}

/// Smallest range covering both
fn hull(a: Option<(i64, i64)>, b: Option<(i64, i64)>) -> Option<(i64, i64)> {
    match (a, b) {
        (Some((alo, ahi)), Some((blo, bhi))) => Some((alo.min(blo), ahi.max(bhi))),
        (a, None) => a,
        (None, b) => b,
    }
}
