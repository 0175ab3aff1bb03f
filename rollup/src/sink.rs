//! Downstream sinks for harvested records.
//!
//! The harvester hands each window's records to a [`Sink`] in key order and
//! reclaims the window only when `publish` returns `Ok`. A sink may therefore
//! see the same window more than once after a failure, but never loses one.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, SinkError};
use crate::record::MetricRecord;

/// Receiver of finalized records.
pub trait Sink: Send + Sync {
    /// Publishes one window's records.
    ///
    /// Returning `Ok` acknowledges the batch; the window is then deleted.
    ///
    /// # Errors
    ///
    /// Any error leaves the window buffered for the next harvest attempt.
    fn publish(&self, records: &[MetricRecord]) -> Result<()>;
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    fn publish(&self, records: &[MetricRecord]) -> Result<()> {
        (**self).publish(records)
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn publish(&self, records: &[MetricRecord]) -> Result<()> {
        (**self).publish(records)
    }
}

/// Writes one JSON object per record and line, flushing after each batch.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> Sink for JsonLinesSink<W> {
    fn publish(&self, records: &[MetricRecord]) -> Result<()> {
        // Serialize first so a bad record never leaves a partial batch behind
        let mut buf = Vec::with_capacity(records.len() * 256);
        for record in records {
            serde_json::to_writer(&mut buf, record).map_err(|e| SinkError::Serialize { source: e })?;
            buf.push(b'\n');
        }

        let mut writer = self.writer.lock();
        writer
            .write_all(&buf)
            .and_then(|()| writer.flush())
            .map_err(|e| SinkError::Io { source: e })?;
        Ok(())
    }
}

/// Collects published batches in memory.
///
/// Can be told to reject the next few batches to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<MetricRecord>>>,
    failures: AtomicUsize,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next `n` batches.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Every acknowledged batch, in publish order.
    pub fn batches(&self) -> Vec<Vec<MetricRecord>> {
        self.batches.lock().clone()
    }

    /// Every acknowledged record, in publish order.
    pub fn records(&self) -> Vec<MetricRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

impl Sink for MemorySink {
    fn publish(&self, records: &[MetricRecord]) -> Result<()> {
        let rejected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(SinkError::Rejected {
                reason: "injected failure".to_string(),
            }
            .into());
        }
        self.batches.lock().push(records.to_vec());
        Ok(())
    }
}
