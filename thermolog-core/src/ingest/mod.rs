//! Ingestion
//!
//! Acquisition and persistence are decoupled by a bounded queue. Sources
//! are polled by the monitor thread (or pushed to by the server) and never
//! wait on the store; a single consumer thread owns the [`Writer`] and
//! drains the queue at a fixed interval.
//!
//! [`Writer`]: crate::Writer

mod pipeline;
mod queue;
mod source;

pub use pipeline::{Monitor, Pipeline, PipelineConfig};
pub use queue::{sample_queue, SampleReceiver, SampleSender};
pub use source::{
    build_sensor, build_toggle, validate_readings, FakeToggle, InvertedToggle, RandomSensor,
    Reading, SensorSource, SharedToggle, SineSensor, Toggle,
};
