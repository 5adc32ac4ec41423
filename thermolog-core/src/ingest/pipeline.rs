//! Monitor and consumer threads

use super::queue::{SampleReceiver, SampleSender};
use super::source::{build_sensor, build_toggle, validate_readings, SensorSource, SharedToggle};
use crate::config::Config;
use crate::{MetricKind, Result, Sample, ThermoError, Timestamp, Writer};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest uninterrupted sleep, bounds shutdown latency
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Timer settings for the ingestion threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// How often the consumer drains the queue
    pub queue_interval: Duration,
    /// How often the monitor polls every source; `None` leaves it idle
    pub monitor_interval: Option<Duration>,
    /// How often deferred rollup refreshes are flushed
    pub stats_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_interval: Duration::from_millis(500),
            monitor_interval: None,
            stats_interval: Duration::from_secs(30),
        }
    }
}

/// The set of polled sources
#[derive(Default)]
pub struct Monitor {
    sensors: Vec<(String, Box<dyn SensorSource>)>,
    toggles: Vec<(String, SharedToggle)>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every sensor and toggle in the configuration
    pub fn from_config(config: &Config) -> Self {
        let mut monitor = Self::new();
        for (id, sensor) in &config.sensors {
            monitor = monitor.with_sensor(id.clone(), build_sensor(sensor));
        }
        for (id, toggle) in &config.toggles {
            monitor = monitor.with_toggle(id.clone(), build_toggle(toggle));
        }
        monitor
    }

    pub fn with_sensor(mut self, id: impl Into<String>, source: Box<dyn SensorSource>) -> Self {
        self.sensors.push((id.into(), source));
        self
    }

    pub fn with_toggle(mut self, id: impl Into<String>, toggle: SharedToggle) -> Self {
        self.toggles.push((id.into(), toggle));
        self
    }

    /// Handles on the toggles, for callers that switch them
    pub fn toggles(&self) -> BTreeMap<String, SharedToggle> {
        self.toggles
            .iter()
            .map(|(id, toggle)| (id.clone(), Arc::clone(toggle)))
            .collect()
    }

    /// Read every source once and enqueue the results stamped with `time`
    ///
    /// A failing source is logged and skipped; the rest of the cycle
    /// proceeds. Returns the number of samples enqueued.
    pub fn poll_once(&mut self, time: Timestamp, queue: &SampleSender) -> usize {
        let mut enqueued = 0;

        for (id, source) in &mut self.sensors {
            debug!(sensor = %id, "Reading sensor");
            let readings = source.read().and_then(|r| validate_readings(&r).map(|_| r));
            match readings {
                Ok(readings) => {
                    for (metric, value) in readings {
                        enqueued += enqueue(queue, Sample::new(id.as_str(), time, metric, value));
                    }
                }
                Err(e) => warn!("{}", ThermoError::sensor(id.as_str(), e)),
            }
        }

        for (id, toggle) in &self.toggles {
            let state = toggle.lock().get();
            match state {
                Ok(on) => {
                    let sample = Sample::new(id.as_str(), time, MetricKind::Toggle, on);
                    enqueued += enqueue(queue, sample);
                }
                Err(e) => warn!("{}", ThermoError::sensor(id.as_str(), e)),
            }
        }

        enqueued
    }
}

fn enqueue(queue: &SampleSender, sample: Sample) -> usize {
    let sensor = sample.sensor.clone();
    match queue.send(sample) {
        Ok(()) => 1,
        Err(e) => {
            error!(sensor = %sensor, error = %e, "Dropping reading");
            0
        }
    }
}

/// Running ingestion threads
///
/// The consumer thread owns the [`Writer`]; it is handed back by
/// [`Pipeline::shutdown`] after the queue has been drained one last time.
pub struct Pipeline {
    running: Arc<AtomicBool>,
    consumer: Option<JoinHandle<Writer>>,
    monitor: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn the consumer, and the monitor if an interval is configured
    pub fn start(
        writer: Writer,
        receiver: SampleReceiver,
        sender: SampleSender,
        monitor: Monitor,
        config: PipelineConfig,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));

        let consumer = {
            let flag = Arc::clone(&running);
            thread::Builder::new()
                .name("thermolog-writer".into())
                .spawn(move || run_consumer(writer, receiver, config, flag))?
        };

        let monitor = match config.monitor_interval {
            Some(interval) => {
                let flag = Arc::clone(&running);
                let spawned = thread::Builder::new()
                    .name("thermolog-monitor".into())
                    .spawn(move || run_monitor(monitor, sender, interval, flag));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        error!(error = %e, "Failed to start monitor, stopping consumer");
                        stop_consumer(&running, consumer)?;
                        return Err(e.into());
                    }
                }
            }
            None => {
                info!("Monitor is idle");
                None
            }
        };

        info!(
            "Ingestion started (queue every {:?}, stats every {:?})",
            config.queue_interval, config.stats_interval
        );
        Ok(Self {
            running,
            consumer: Some(consumer),
            monitor,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop both threads and return the writer
    ///
    /// Samples enqueued before this call are recorded and pending rollup
    /// refreshes are flushed before the writer is returned.
    pub fn shutdown(mut self) -> Result<Writer> {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.monitor.take() {
            handle
                .join()
                .map_err(|_| ThermoError::Worker("monitor thread panicked".into()))?;
        }

        let consumer = self
            .consumer
            .take()
            .ok_or_else(|| ThermoError::Worker("consumer already stopped".into()))?;
        let writer = stop_consumer(&self.running, consumer)?;

        info!("Ingestion stopped");
        Ok(writer)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Clear `running` and wait for the consumer to drain, flush and hand
/// back the writer
fn stop_consumer(running: &AtomicBool, consumer: JoinHandle<Writer>) -> Result<Writer> {
    running.store(false, Ordering::Release);
    consumer
        .join()
        .map_err(|_| ThermoError::Worker("consumer thread panicked".into()))
}

/// Sleep until `deadline`, waking early once `running` is cleared
fn sleep_until(deadline: Instant, running: &AtomicBool) {
    loop {
        let now = Instant::now();
        if now >= deadline || !running.load(Ordering::Acquire) {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

fn run_consumer(
    mut writer: Writer,
    receiver: SampleReceiver,
    config: PipelineConfig,
    running: Arc<AtomicBool>,
) -> Writer {
    let mut next_flush = Instant::now() + config.stats_interval;

    loop {
        // Checked before draining so nothing enqueued before shutdown is lost
        let stopping = !running.load(Ordering::Acquire);

        let batch = receiver.drain();
        let closed = batch.is_none();
        if let Some(batch) = batch {
            record_batch(&mut writer, batch);
        }

        if stopping || closed || Instant::now() >= next_flush {
            match writer.flush_pending() {
                Ok(0) => {}
                Ok(n) => debug!("Refreshed {} deferred rollup buckets", n),
                Err(e) => error!(error = %e, "Deferred rollup refresh failed"),
            }
            next_flush = Instant::now() + config.stats_interval;
        }

        if stopping || closed {
            return writer;
        }
        sleep_until(Instant::now() + config.queue_interval, &running);
    }
}

fn record_batch(writer: &mut Writer, batch: Vec<Sample>) {
    if batch.is_empty() {
        return;
    }

    let total = batch.len();
    let mut failed = 0;
    for sample in &batch {
        if let Err(e) = writer.record(sample) {
            failed += 1;
            error!(
                sensor = %sample.sensor,
                metric = %sample.metric,
                time = %sample.time,
                error = %e,
                retryable = e.is_retryable(),
                "Dropping sample"
            );
        }
    }
    debug!("Recorded {} of {} queued samples", total - failed, total);
}

fn run_monitor(
    mut monitor: Monitor,
    queue: SampleSender,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        let cycle_start = Instant::now();
        let enqueued = monitor.poll_once(Utc::now(), &queue);
        debug!("Monitor cycle enqueued {} readings", enqueued);
        sleep_until(cycle_start + interval, &running);
    }
}
