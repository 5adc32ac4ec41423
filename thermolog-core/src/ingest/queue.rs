//! Bounded FIFO between acquisition and the writer

use crate::{Result, Sample, ThermoError};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

/// Create a queue holding at most `capacity` samples
pub fn sample_queue(capacity: usize) -> (SampleSender, SampleReceiver) {
    let (tx, rx) = bounded(capacity);
    (SampleSender { tx }, SampleReceiver { rx })
}

/// Producer side; cheap to clone
#[derive(Clone)]
pub struct SampleSender {
    tx: Sender<Sample>,
}

impl SampleSender {
    /// Enqueue a sample without blocking
    pub fn send(&self, sample: Sample) -> Result<()> {
        self.tx.try_send(sample).map_err(|e| match e {
            TrySendError::Full(_) => ThermoError::QueueFull(self.tx.len()),
            TrySendError::Disconnected(_) => ThermoError::QueueClosed,
        })
    }

    /// Samples waiting to be drained
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Consumer side, owned by the pipeline's consumer thread
pub struct SampleReceiver {
    rx: Receiver<Sample>,
}

impl SampleReceiver {
    /// Take every sample currently queued, oldest first
    ///
    /// Returns `None` once the queue is empty and every sender is gone.
    pub fn drain(&self) -> Option<Vec<Sample>> {
        let mut batch = Vec::with_capacity(self.rx.len());
        loop {
            match self.rx.try_recv() {
                Ok(sample) => batch.push(sample),
                Err(TryRecvError::Empty) => return Some(batch),
                Err(TryRecvError::Disconnected) if batch.is_empty() => return None,
                Err(TryRecvError::Disconnected) => return Some(batch),
            }
        }
    }
}
