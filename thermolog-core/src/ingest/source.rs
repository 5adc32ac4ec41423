//! Sensor and toggle sources

use crate::config::{SensorConfig, SensorKind, ToggleConfig, ToggleKind};
use crate::{MetricKind, SampleValue, SensorError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// One acquired value
pub type Reading = (MetricKind, SampleValue);

/// A device producing readings on demand
///
/// Implementations may block (hardware retries, network calls); they are
/// only ever called from the monitor thread.
pub trait SensorSource: Send {
    fn read(&mut self) -> Result<Vec<Reading>, SensorError>;
}

/// A switchable device
pub trait Toggle: Send {
    fn get(&mut self) -> Result<bool, SensorError>;
    fn set(&mut self, on: bool) -> Result<(), SensorError>;
}

/// A toggle shared between the monitor and the serving layer
pub type SharedToggle = Arc<Mutex<Box<dyn Toggle>>>;

/// Reject readings no real device can produce
pub fn validate_readings(readings: &[Reading]) -> Result<(), SensorError> {
    for &(metric, value) in readings {
        let v = value.as_f64();
        let plausible = v.is_finite()
            && match metric {
                MetricKind::Humidity => (0.0..=100.0).contains(&v),
                MetricKind::Temperature | MetricKind::Toggle => true,
            };
        if !plausible {
            return Err(SensorError::OutOfRange { metric, value: v });
        }
    }
    Ok(())
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Synthetic signal with variation visible at both day and year scale
/// when polled once a minute
#[derive(Debug, Clone)]
pub struct SineSensor {
    x: f64,
}

impl SineSensor {
    pub fn new(source: &str) -> Self {
        Self {
            x: (phase_seed(source) % 1_000_000) as f64,
        }
    }
}

/// 64-bit FNV-1a of the source string, stable across builds and platforms
fn phase_seed(source: &str) -> u64 {
    source.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

impl SensorSource for SineSensor {
    fn read(&mut self) -> Result<Vec<Reading>, SensorError> {
        self.x += 1.0;
        // y in [-0.5, 0.5]
        let y = 0.25 * ((self.x / 60.0).sin() + (self.x / 60.0 / 24.0 / 100.0).sin());
        Ok(vec![
            (MetricKind::Temperature, round2(40.0 * (y + 0.3)).into()),
            (MetricKind::Humidity, round2(100.0 * (y + 0.5)).into()),
        ])
    }
}

/// Uniform random humidity in [0, 100) and temperature in [-15, 35)
#[derive(Debug)]
pub struct RandomSensor {
    rng: StdRng,
}

impl RandomSensor {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for RandomSensor {
    fn read(&mut self) -> Result<Vec<Reading>, SensorError> {
        let hum = self.rng.gen::<f64>() * 100.0;
        let temp = self.rng.gen::<f64>() * 50.0 - 15.0;
        Ok(vec![
            (MetricKind::Temperature, temp.into()),
            (MetricKind::Humidity, hum.into()),
        ])
    }
}

/// In-memory switch, initially off
#[derive(Debug, Default, Clone)]
pub struct FakeToggle {
    state: bool,
}

impl Toggle for FakeToggle {
    fn get(&mut self) -> Result<bool, SensorError> {
        Ok(self.state)
    }

    fn set(&mut self, on: bool) -> Result<(), SensorError> {
        self.state = on;
        Ok(())
    }
}

/// Wraps a toggle wired in reverse
pub struct InvertedToggle<T>(pub T);

impl<T: Toggle> Toggle for InvertedToggle<T> {
    fn get(&mut self) -> Result<bool, SensorError> {
        self.0.get().map(|on| !on)
    }

    fn set(&mut self, on: bool) -> Result<(), SensorError> {
        self.0.set(!on)
    }
}

/// Instantiate the source for a configured sensor
pub fn build_sensor(config: &SensorConfig) -> Box<dyn SensorSource> {
    match config.kind {
        SensorKind::Sine => Box::new(SineSensor::new(&config.source)),
        SensorKind::Random => Box::new(RandomSensor::new()),
    }
}

/// Instantiate the device for a configured toggle
pub fn build_toggle(config: &ToggleConfig) -> SharedToggle {
    let toggle: Box<dyn Toggle> = match (config.kind, config.invert) {
        (ToggleKind::Fake, false) => Box::new(FakeToggle::default()),
        (ToggleKind::Fake, true) => Box::new(InvertedToggle(FakeToggle::default())),
    };
    Arc::new(Mutex::new(toggle))
}
