use chrono::{Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet};
use std::thread;
use tempfile::TempDir;
use thermolog_core::bucket::floor_millis;
use thermolog_core::{
    to_millis, MetricKind, Reader, Sample, StatRow, StoreConfig, Timestamp, ViewRange, Writer,
};

fn base() -> Timestamp {
    Utc.with_ymd_and_hms(2017, 8, 28, 0, 0, 0).unwrap()
}

fn setup(name: &str) -> (TempDir, StoreConfig, Writer) {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::at(temp_dir.path().join(name));
    let writer = Writer::open(config.clone()).unwrap();
    (temp_dir, config, writer)
}

/// Record `n` random samples spread over ten days for two sensors
fn populate(writer: &mut Writer, n: usize, seed: u64) -> Vec<Sample> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples = Vec::with_capacity(n);
    for _ in 0..n {
        let sensor = if rng.gen_bool(0.5) { "living" } else { "garden" };
        let offset = Duration::seconds(rng.gen_range(0..10 * 24 * 3600));
        let sample = if rng.gen_bool(0.2) {
            Sample::new(sensor, base() + offset, MetricKind::Toggle, rng.gen_bool(0.5))
        } else {
            let metric = if rng.gen_bool(0.5) {
                MetricKind::Temperature
            } else {
                MetricKind::Humidity
            };
            Sample::new(sensor, base() + offset, metric, rng.gen_range(0.0..100.0))
        };
        writer.record(&sample).unwrap();
        samples.push(sample);
    }
    samples
}

/// Expected aggregates keyed by (bucket, metric), honoring last-write-wins
fn expected(
    samples: &[Sample],
    sensor: &str,
    width_ms: i64,
) -> BTreeMap<(i64, MetricKind), (f64, f64, f64)> {
    let mut latest = BTreeMap::new();
    for s in samples.iter().filter(|s| s.sensor == sensor) {
        latest.insert((to_millis(s.time), s.metric), s.value.as_f64());
    }

    let mut groups: BTreeMap<(i64, MetricKind), Vec<f64>> = BTreeMap::new();
    for ((time, metric), value) in latest {
        groups
            .entry((floor_millis(time, width_ms), metric))
            .or_default()
            .push(value);
    }
    groups
        .into_iter()
        .map(|(key, values)| {
            let avg = values.iter().sum::<f64>() / values.len() as f64;
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (key, (avg, min, max))
        })
        .collect()
}

fn assert_close(a: Option<f64>, b: f64) {
    let a = a.expect("aggregate missing");
    assert!((a - b).abs() < 1e-9, "{a} != {b}");
}

#[test]
fn test_rollups_match_raw_aggregates() {
    let (_dir, config, mut writer) = setup("correct.db");
    let samples = populate(&mut writer, 600, 42);
    let mut reader = Reader::open(&config).unwrap();
    let (from, to) = (base() - Duration::days(1), base() + Duration::days(11));

    for view in [ViewRange::Day, ViewRange::Week, ViewRange::Month, ViewRange::Year] {
        for sensor in ["living", "garden"] {
            let width = config.widths.width_ms(view);
            let want = expected(&samples, sensor, width);
            let rows = reader.get_stats(sensor, from, to, view).unwrap();

            let mut found = 0;
            for row in &rows {
                match want.get(&(to_millis(row.bucket_start), row.metric)) {
                    Some(&(avg, min, max)) => {
                        assert_close(row.avg, avg);
                        assert_close(row.min, min);
                        assert_close(row.max, max);
                        found += 1;
                    }
                    None => assert!(row.is_empty(), "{view} {row:?} should be empty"),
                }
            }
            assert_eq!(found, want.len(), "{sensor} {view}");
        }
    }
}

#[test]
fn test_gap_fill_returns_one_row_per_bucket_and_metric() {
    let (_dir, config, mut writer) = setup("gaps.db");
    populate(&mut writer, 200, 7);
    let mut reader = Reader::open(&config).unwrap();

    // Warm a few scattered windows so the cache is patchy
    for day in [1, 4, 5] {
        let from = base() + Duration::days(day);
        reader
            .get_stats("living", from, from + Duration::hours(6), ViewRange::Week)
            .unwrap();
    }

    let (from, to) = (base() - Duration::days(3), base() + Duration::days(14));
    let rows = reader.get_stats("living", from, to, ViewRange::Week).unwrap();
    let buckets: Vec<Timestamp> = config.widths.enumerate(from, to, ViewRange::Week).collect();
    let metrics = reader.metrics("living").unwrap();

    assert_eq!(rows.len(), buckets.len() * metrics.len());
    let keys: HashSet<_> = rows.iter().map(|r| (r.bucket_start, r.metric)).collect();
    assert_eq!(keys.len(), rows.len());
    for bucket in &buckets {
        for metric in &metrics {
            assert!(keys.contains(&(*bucket, *metric)));
        }
    }
    assert!(rows
        .windows(2)
        .all(|w| (w[0].bucket_start, w[0].metric) < (w[1].bucket_start, w[1].metric)));
}

#[test]
fn test_cached_rollups_survive_raw_deletion() {
    let (dir, config, mut writer) = setup("purge.db");
    populate(&mut writer, 100, 3);
    let mut reader = Reader::open(&config).unwrap();
    let (from, to) = (base(), base() + Duration::days(10));

    let before = reader.get_stats("garden", from, to, ViewRange::Month).unwrap();
    assert!(before.iter().any(|r| !r.is_empty()));

    let conn = rusqlite::Connection::open(dir.path().join("purge.db")).unwrap();
    conn.execute("DELETE FROM samples", []).unwrap();
    assert!(reader.date_span().unwrap().is_none());

    let after = reader.get_stats("garden", from, to, ViewRange::Month).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_overwrite_leaves_only_last_value() {
    let (_dir, config, mut writer) = setup("upsert.db");
    let t = base() + Duration::hours(14);
    writer
        .record(&Sample::new("s1", t, MetricKind::Temperature, 20.0))
        .unwrap();
    writer
        .record(&Sample::new("s1", t, MetricKind::Temperature, 25.0))
        .unwrap();

    let mut reader = Reader::open(&config).unwrap();
    let raw = reader.get("s1", t, t + Duration::seconds(1)).unwrap();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].value, 25.0);

    for view in ViewRange::ALL {
        let bucket = config.widths.bucket_start(t, view).unwrap();
        let rows = reader
            .get_stats("s1", bucket, bucket + Duration::milliseconds(1), view)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].avg, Some(25.0), "{view}");
    }
}

#[test]
fn test_reindex_reproduces_cache() {
    let (_dir, config, mut writer) = setup("reindex.db");
    populate(&mut writer, 300, 11);
    let mut reader = Reader::open(&config).unwrap();
    let (from, to) = (base(), base() + Duration::days(10));

    let snapshot = |reader: &mut Reader| -> Vec<Vec<StatRow>> {
        let mut all = Vec::new();
        for view in ViewRange::ALL {
            for sensor in ["living", "garden"] {
                all.push(reader.get_stats(sensor, from, to, view).unwrap());
            }
        }
        all
    };

    let before = snapshot(&mut reader);
    let stats = writer.reindex_all().unwrap();
    assert_eq!(stats.sensors, 2);
    assert_eq!(before, snapshot(&mut reader));
}

#[test]
fn test_concurrent_readers_never_see_torn_aggregates() {
    let (_dir, config, mut writer) = setup("concurrent.db");
    let bucket = base() + Duration::hours(14);
    writer
        .record(&Sample::new("s1", bucket, MetricKind::Temperature, 1.0))
        .unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let config = config.clone();
            thread::spawn(move || {
                let mut reader = Reader::open(&config).unwrap();
                for _ in 0..50 {
                    let rows = reader
                        .get_stats("s1", bucket, bucket + Duration::minutes(1), ViewRange::Hour)
                        .unwrap();
                    assert_eq!(rows.len(), 1);
                    let (avg, min, max) =
                        (rows[0].avg.unwrap(), rows[0].min.unwrap(), rows[0].max.unwrap());
                    // Values 1..=k were written, so any whole state has min 1 and avg (1 + k) / 2
                    assert_eq!(min, 1.0);
                    assert!((avg - (min + max) / 2.0).abs() < 1e-9, "torn: {avg} {min} {max}");
                }
            })
        })
        .collect();

    for k in 2..=50 {
        let t = bucket + Duration::milliseconds(k * 100);
        writer
            .record(&Sample::new("s1", t, MetricKind::Temperature, k as f64))
            .unwrap();
    }

    for handle in readers {
        handle.join().unwrap();
    }
}
