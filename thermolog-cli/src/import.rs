//! Bulk import of logged climate readings
//!
//! Each line holds a local logger timestamp followed by temperature and
//! humidity, separated by whitespace:
//!
//! ```text
//! 20170828T143000 21.5 48.0
//! ```
//!
//! Timestamps are taken as UTC. Malformed lines are skipped with a warning.

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use std::io::BufRead;
use thermolog_core::ingest::validate_readings;
use thermolog_core::{MetricKind, Sample, SampleValue, Timestamp, Writer};
use tracing::{debug, warn};

const TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Counts reported after an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub lines: usize,
    pub imported: usize,
    pub skipped: usize,
}

/// One parsed line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoggedReading {
    pub time: Timestamp,
    pub temperature: f64,
    pub humidity: f64,
}

impl LoggedReading {
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [time, temperature, humidity] = fields[..] else {
            bail!("expected 3 fields, found {}", fields.len());
        };

        let time = NaiveDateTime::parse_from_str(time, TIME_FORMAT)
            .with_context(|| format!("bad timestamp {time:?}"))?
            .and_utc();
        let temperature: f64 = temperature
            .parse()
            .with_context(|| format!("bad temperature {temperature:?}"))?;
        let humidity: f64 = humidity
            .parse()
            .with_context(|| format!("bad humidity {humidity:?}"))?;

        validate_readings(&[
            (MetricKind::Temperature, SampleValue::Float(temperature)),
            (MetricKind::Humidity, SampleValue::Float(humidity)),
        ])?;

        Ok(Self {
            time,
            temperature,
            humidity,
        })
    }

    fn samples(&self, sensor: &str) -> [Sample; 2] {
        [
            Sample::new(sensor, self.time, MetricKind::Temperature, self.temperature),
            Sample::new(sensor, self.time, MetricKind::Humidity, self.humidity),
        ]
    }
}

/// Record every well-formed line of `input` as samples of `sensor`
///
/// Rollups are left to the caller; a bulk load is normally followed by
/// [`Writer::reindex_all`].
pub fn import<R: BufRead>(writer: &mut Writer, sensor: &str, input: R) -> Result<ImportStats> {
    let mut stats = ImportStats::default();

    for (index, line) in input.lines().enumerate() {
        let line = line.context("reading input")?;
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;

        match LoggedReading::parse(&line) {
            Ok(reading) => {
                for sample in reading.samples(sensor) {
                    writer.record(&sample)?;
                }
                stats.imported += 1;
            }
            Err(e) => {
                warn!("Skipping line {}: {:#}", index + 1, e);
                stats.skipped += 1;
            }
        }
    }

    debug!(
        "Imported {} of {} lines for {}",
        stats.imported, stats.lines, sensor
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;
    use thermolog_core::{Reader, StoreConfig, ViewRange, WriteMode};

    #[test]
    fn test_parse_line() {
        let reading = LoggedReading::parse("20170828T143000 21.5 48\n").unwrap();
        assert_eq!(reading.time, Utc.with_ymd_and_hms(2017, 8, 28, 14, 30, 0).unwrap());
        assert_eq!(reading.temperature, 21.5);
        assert_eq!(reading.humidity, 48.0);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(LoggedReading::parse("20170828T143000 21.5").is_err());
        assert!(LoggedReading::parse("2017-08-28 21.5 48").is_err());
        assert!(LoggedReading::parse("20170828T143000 warm 48").is_err());
        assert!(LoggedReading::parse("20170828T143000 21.5 48 extra").is_err());
        // Humidity is a percentage
        assert!(LoggedReading::parse("20170828T143000 21.5 140").is_err());
    }

    #[test]
    fn test_import_skips_bad_lines() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = StoreConfig::at(temp_dir.path().join("import.db"));
        config.write_mode = WriteMode::Deferred;
        let mut writer = Writer::open(config.clone()).unwrap();

        let input = "\
20170828T140000 20.0 40.0
garbage
20170828T141000 22.0 50.0

20170828T143000 nan 50.0
20170828T150500 18.0 60.0
";
        let stats = import(&mut writer, "cellar", input.as_bytes()).unwrap();
        assert_eq!(
            stats,
            ImportStats {
                lines: 5,
                imported: 3,
                skipped: 2
            }
        );

        writer.reindex_all().unwrap();
        assert_eq!(writer.pending_buckets(), 0);

        let mut reader = Reader::open(&config).unwrap();
        let from = Utc.with_ymd_and_hms(2017, 8, 28, 14, 0, 0).unwrap();
        let raw = reader.get("cellar", from, from + Duration::hours(2)).unwrap();
        assert_eq!(raw.len(), 6);

        let rows = reader
            .get_stats("cellar", from, from + Duration::hours(2), ViewRange::Month)
            .unwrap();
        let temp = rows
            .iter()
            .find(|r| r.metric == MetricKind::Temperature)
            .unwrap();
        assert_eq!(temp.min, Some(18.0));
        assert_eq!(temp.max, Some(22.0));
        assert_eq!(temp.avg, Some(20.0));
    }
}
