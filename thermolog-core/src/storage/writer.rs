//! Writer - the single mutating connection

use super::{raw, rollup, schema, StoreConfig, WriteMode};
use crate::bucket::floor_millis;
use crate::types::to_millis;
use crate::{Result, Sample, Timestamp, ViewRange};
use rusqlite::{Connection, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Records samples and keeps the rollup cache consistent with them
pub struct Writer {
    conn: Connection,
    config: StoreConfig,
    /// Buckets awaiting refresh in deferred mode, keyed by sensor and view
    pending: BTreeMap<(String, ViewRange), BTreeSet<i64>>,
}

/// Outcome of a full rollup rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReindexStats {
    pub sensors: usize,
    pub buckets: usize,
    pub rows: usize,
}

impl Writer {
    /// Open the store for writing, creating it if needed
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.widths.validate()?;
        let conn = schema::open_writer(&config)?;
        info!("Opened store {:?} for writing ({:?} rollups)", config.path, config.write_mode);

        let mut writer = Self {
            conn,
            config,
            pending: BTreeMap::new(),
        };
        writer.adopt_widths()?;
        Ok(writer)
    }

    /// Rebuild the rollups of every view range whose bucket width differs
    /// from the one the store was built with
    ///
    /// Cached rows of a changed view are dropped entirely, including
    /// summaries of purged raw samples, which cannot be recomputed.
    fn adopt_widths(&mut self) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = schema::width_mismatches(&tx, &self.config.widths)?;
        if changed.is_empty() {
            return Ok(());
        }

        let stored = schema::stored_widths(&tx)?;
        for &view in &changed {
            let width = self.config.widths.width_ms(view);
            let dropped = rollup::delete_view(&tx, view)?;
            if stored.contains_key(&view) || dropped > 0 {
                warn!(
                    view = %view,
                    dropped,
                    "Bucket width changed to {}ms, rebuilding rollups",
                    width
                );
            }
            schema::store_width(&tx, view, width)?;
        }

        let stats = rebuild(&tx, &self.config, &changed)?;
        tx.commit()?;
        if stats.rows > 0 {
            info!(
                "Rebuilt {} rollup rows for {} sensors after a bucket width change",
                stats.rows, stats.sensors
            );
        }
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Persist a sample and bring the rollups covering it up to date
    ///
    /// In synchronous mode the raw write and the refresh of every view
    /// range commit together, so readers see either neither or both.
    pub fn record(&mut self, sample: &Sample) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        raw::insert(&tx, sample)?;
        raw::register_series(&tx, &sample.sensor, sample.metric)?;

        let time_ms = to_millis(sample.time);
        match self.config.write_mode {
            WriteMode::Synchronous => {
                refresh_at(&tx, &self.config, &sample.sensor, time_ms)?;
            }
            WriteMode::Deferred => {
                for view in ViewRange::ALL {
                    let width = self.config.widths.width_ms(view);
                    self.pending
                        .entry((sample.sensor.clone(), view))
                        .or_default()
                        .insert(floor_millis(time_ms, width));
                }
            }
        }

        tx.commit()?;
        debug!(
            sensor = %sample.sensor,
            metric = %sample.metric,
            time = %sample.time,
            "Recorded sample"
        );
        Ok(())
    }

    /// Recompute the buckets covering `time` at every view range
    pub fn refresh_bucket(&mut self, sensor: &str, time: Timestamp) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        refresh_at(&tx, &self.config, sensor, to_millis(time))?;
        tx.commit()?;
        Ok(())
    }

    /// Number of distinct buckets waiting for a deferred refresh
    pub fn pending_buckets(&self) -> usize {
        self.pending.values().map(BTreeSet::len).sum()
    }

    /// Refresh every bucket touched since the last flush, once each
    pub fn flush_pending(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut refreshed = 0;
        for ((sensor, view), buckets) in &self.pending {
            let buckets: Vec<i64> = buckets.iter().copied().collect();
            rollup::refresh(
                &tx,
                sensor,
                *view,
                self.config.widths.width_ms(*view),
                &buckets,
                self.config.max_query_params,
            )?;
            refreshed += buckets.len();
        }
        tx.commit()?;

        // Only forget the pending set once the refresh is durable
        self.pending.clear();
        debug!("Flushed {} pending rollup buckets", refreshed);
        Ok(refreshed)
    }

    /// Rebuild rollups for every bucket that holds raw samples
    ///
    /// Cached rows inside each sensor's raw time span are dropped first, so
    /// stale negative entries disappear and are recomputed on demand. Rows
    /// outside the span (summaries of purged raw data) are kept.
    pub fn reindex_all(&mut self) -> Result<ReindexStats> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stats = rebuild(&tx, &self.config, &ViewRange::ALL)?;
        tx.commit()?;
        self.pending.clear();
        info!(
            "Reindexed {} sensors: {} buckets, {} rollup rows",
            stats.sensors, stats.buckets, stats.rows
        );
        Ok(stats)
    }
}

/// Recompute the given view ranges for every bucket holding raw samples
///
/// Cached rows inside each sensor's raw span are dropped first.
fn rebuild(conn: &Connection, config: &StoreConfig, views: &[ViewRange]) -> Result<ReindexStats> {
    let mut stats = ReindexStats::default();

    for sensor in raw::sensors(conn)? {
        let times = raw::sample_times(conn, &sensor)?;
        let (Some(&first), Some(&last)) = (times.first(), times.last()) else {
            continue;
        };

        for &view in views {
            let width = config.widths.width_ms(view);
            let mut buckets: Vec<i64> = times.iter().map(|t| floor_millis(*t, width)).collect();
            buckets.dedup();

            rollup::delete_range(conn, &sensor, view, floor_millis(first, width), last + 1)?;
            stats.rows += rollup::refresh(
                conn,
                &sensor,
                view,
                width,
                &buckets,
                config.max_query_params,
            )?;
            stats.buckets += buckets.len();
        }
        stats.sensors += 1;
    }
    Ok(stats)
}

/// Refresh the bucket containing `time_ms` at every view range
fn refresh_at(conn: &Connection, config: &StoreConfig, sensor: &str, time_ms: i64) -> Result<()> {
    for view in ViewRange::ALL {
        let width = config.widths.width_ms(view);
        rollup::refresh(
            conn,
            sensor,
            view,
            width,
            &[floor_millis(time_ms, width)],
            config.max_query_params,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MetricKind, Reader};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2017, 8, 28, h, m, s).unwrap()
    }

    fn cached_rows(writer: &Writer, view: ViewRange) -> Vec<crate::StatRow> {
        rollup::fetch(&writer.conn, "s1", view, i64::MIN, i64::MAX).unwrap()
    }

    #[test]
    fn test_record_refreshes_every_view_range() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = Writer::open(StoreConfig::at(temp_dir.path().join("w.db"))).unwrap();

        writer
            .record(&Sample::new("s1", at(14, 31, 15), MetricKind::Temperature, 20.0))
            .unwrap();
        writer
            .record(&Sample::new("s1", at(14, 39, 15), MetricKind::Temperature, 22.0))
            .unwrap();

        let hour = cached_rows(&writer, ViewRange::Hour);
        assert_eq!(hour.len(), 2);
        assert_eq!(hour[0].bucket_start, at(14, 31, 0));
        assert_eq!(hour[1].avg, Some(22.0));

        let day = cached_rows(&writer, ViewRange::Day);
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].bucket_start, at(14, 30, 0));
        assert_eq!(day[0].avg, Some(21.0));
        assert_eq!(day[0].min, Some(20.0));
        assert_eq!(day[0].max, Some(22.0));

        for view in ViewRange::ALL {
            assert!(!cached_rows(&writer, view).is_empty(), "{view} not refreshed");
        }
    }

    #[test]
    fn test_record_overwrite_updates_rollup() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = Writer::open(StoreConfig::at(temp_dir.path().join("w.db"))).unwrap();

        writer
            .record(&Sample::new("s1", at(14, 0, 0), MetricKind::Temperature, 20.0))
            .unwrap();
        writer
            .record(&Sample::new("s1", at(14, 0, 0), MetricKind::Temperature, 30.0))
            .unwrap();

        let week = cached_rows(&writer, ViewRange::Week);
        assert_eq!(week.len(), 1);
        assert_eq!(week[0].avg, Some(30.0));
    }

    #[test]
    fn test_toggle_rollups_are_fractions() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = Writer::open(StoreConfig::at(temp_dir.path().join("w.db"))).unwrap();

        for (m, on) in [(0, true), (1, false), (2, true), (3, true)] {
            writer
                .record(&Sample::new("s1", at(14, m, 0), MetricKind::Toggle, on))
                .unwrap();
        }

        let day = cached_rows(&writer, ViewRange::Day);
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].metric, MetricKind::Toggle);
        assert_eq!(day[0].avg, Some(0.75));
        assert_eq!(day[0].min, Some(0.0));
        assert_eq!(day[0].max, Some(1.0));
    }

    #[test]
    fn test_deferred_mode_dedups_buckets() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig {
            write_mode: WriteMode::Deferred,
            ..StoreConfig::at(temp_dir.path().join("w.db"))
        };
        let mut writer = Writer::open(config).unwrap();

        for s in [1, 10, 20, 30] {
            writer
                .record(&Sample::new("s1", at(14, 31, s), MetricKind::Temperature, s as f64))
                .unwrap();
        }
        assert!(cached_rows(&writer, ViewRange::Hour).is_empty());
        // One bucket per view range
        assert_eq!(writer.pending_buckets(), ViewRange::ALL.len());

        assert_eq!(writer.flush_pending().unwrap(), ViewRange::ALL.len());
        assert_eq!(writer.pending_buckets(), 0);
        assert_eq!(writer.flush_pending().unwrap(), 0);

        let hour = cached_rows(&writer, ViewRange::Hour);
        assert_eq!(hour.len(), 1);
        assert_eq!(hour[0].avg, Some(15.25));
    }

    #[test]
    fn test_reindex_matches_incremental_cache() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::at(temp_dir.path().join("w.db"));
        let mut writer = Writer::open(config.clone()).unwrap();

        for i in 0..40u32 {
            let t = at(10 + i / 10, (i * 7) % 60, i % 60);
            writer
                .record(&Sample::new("s1", t, MetricKind::Temperature, i as f64))
                .unwrap();
            writer
                .record(&Sample::new("s2", t, MetricKind::Humidity, 50.0 + i as f64))
                .unwrap();
        }

        let mut reader = Reader::open(&config).unwrap();
        let mut before = Vec::new();
        for view in ViewRange::ALL {
            for sensor in ["s1", "s2"] {
                before.push(reader.get_stats(sensor, at(0, 0, 0), at(23, 0, 0), view).unwrap());
            }
        }

        let stats = writer.reindex_all().unwrap();
        assert_eq!(stats.sensors, 2);
        assert!(stats.buckets > 0);

        let mut after = Vec::new();
        for view in ViewRange::ALL {
            for sensor in ["s1", "s2"] {
                after.push(reader.get_stats(sensor, at(0, 0, 0), at(23, 0, 0), view).unwrap());
            }
        }
        assert_eq!(before, after);
    }

    #[test]
    fn test_refresh_bucket_after_external_change() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = Writer::open(StoreConfig::at(temp_dir.path().join("w.db"))).unwrap();
        writer
            .record(&Sample::new("s1", at(14, 0, 0), MetricKind::Temperature, 20.0))
            .unwrap();

        writer.conn.execute("DELETE FROM samples", []).unwrap();
        assert_eq!(cached_rows(&writer, ViewRange::Hour)[0].avg, Some(20.0));

        writer.refresh_bucket("s1", at(14, 0, 30)).unwrap();
        assert!(cached_rows(&writer, ViewRange::Hour)[0].is_empty());
    }

    #[test]
    fn test_width_change_rebuilds_rollups() {
        let temp_dir = TempDir::new().unwrap();
        let daily = StoreConfig::at(temp_dir.path().join("w.db"));
        let mut writer = Writer::open(daily.clone()).unwrap();
        writer
            .record(&Sample::new("s1", at(1, 0, 0), MetricKind::Temperature, 10.0))
            .unwrap();
        writer
            .record(&Sample::new("s1", at(20, 0, 0), MetricKind::Temperature, 30.0))
            .unwrap();
        drop(writer);

        let mut six_hourly = daily.clone();
        six_hourly
            .widths
            .set_width(ViewRange::Month, std::time::Duration::from_secs(6 * 3600));

        // Readers refuse rollups built with other widths
        assert!(matches!(
            Reader::open(&six_hourly),
            Err(crate::ThermoError::Config(_))
        ));

        let writer = Writer::open(six_hourly.clone()).unwrap();
        let month = cached_rows(&writer, ViewRange::Month);
        assert_eq!(month.len(), 2);
        assert_eq!(month[0].bucket_start, at(0, 0, 0));
        assert_eq!(month[0].avg, Some(10.0));
        assert_eq!(month[1].bucket_start, at(18, 0, 0));
        assert_eq!(month[1].avg, Some(30.0));
        // Untouched views keep their rows
        assert_eq!(cached_rows(&writer, ViewRange::Hour).len(), 2);

        let mut reader = Reader::open(&six_hourly).unwrap();
        let rows = reader
            .get_stats("s1", at(0, 0, 0), at(23, 0, 0), ViewRange::Month)
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].avg, Some(10.0));
        assert!(rows[1].is_empty() && rows[2].is_empty());
        assert!(Reader::open(&daily).is_err());
        drop(writer);

        // Reopening with the old widths switches back
        let writer = Writer::open(daily.clone()).unwrap();
        let month = cached_rows(&writer, ViewRange::Month);
        assert_eq!(month.len(), 1);
        assert_eq!(month[0].avg, Some(20.0));
        assert!(Reader::open(&six_hourly).is_err());
    }
}
