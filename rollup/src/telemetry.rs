//! Operational metrics.
//!
//! Synchronous counters are updated inline by the aggregator and harvester.
//! Storage statistics are pulled: a [`StatsSampler`] owns a snapshot function
//! and a fixed set of gauges, and refreshes the gauges on a timer. Every
//! metric is registered on a caller-owned [`prometheus::Registry`]; the
//! sampler unregisters its gauges when dropped.

use std::fmt;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::key::Level;
use crate::store::StoreStats;

/// Counters updated on the ingestion path.
#[derive(Debug, Clone)]
pub struct AggregatorMetrics {
    /// `add` / `add_batch` calls.
    pub requests_total: IntCounter,
    /// Calls that returned an error.
    pub requests_failed: IntCounter,
    /// Events received.
    pub events_total: IntCounter,
    /// Events merged into at least one interval.
    pub events_processed: IntCounter,
    /// Approximate payload bytes received.
    pub bytes_ingested: IntCounter,
    /// Per-interval contributions skipped because the window had closed.
    pub events_too_late: IntCounter,
    /// Identities redirected to an overflow key, by level.
    pub overflow: IntCounterVec,
}

impl AggregatorMetrics {
    /// Creates unregistered counters.
    ///
    /// # Errors
    ///
    /// Returns a telemetry error if a metric descriptor is invalid.
    pub fn new() -> Result<Self> {
        Ok(Self {
            requests_total: IntCounter::new(
                "aggregator_requests_total",
                "Aggregation requests received",
            )?,
            requests_failed: IntCounter::new(
                "aggregator_requests_failed_total",
                "Aggregation requests that failed",
            )?,
            events_total: IntCounter::new("aggregator_events_total", "Events received")?,
            events_processed: IntCounter::new(
                "aggregator_events_processed_total",
                "Events merged into the buffer store",
            )?,
            bytes_ingested: IntCounter::new(
                "aggregator_bytes_ingested_total",
                "Event payload bytes received",
            )?,
            events_too_late: IntCounter::new(
                "aggregator_events_too_late_total",
                "Interval contributions dropped because their window had closed",
            )?,
            overflow: IntCounterVec::new(
                Opts::new(
                    "aggregator_overflow_total",
                    "Identities redirected to an overflow key",
                ),
                &["level"],
            )?,
        })
    }

    /// Creates the counters and registers them on `registry`.
    ///
    /// # Errors
    ///
    /// Returns a telemetry error if a metric is already registered.
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self::new()?;
        for collector in metrics.collectors() {
            registry.register(collector)?;
        }
        Ok(metrics)
    }

    /// Counts one overflow redirection at `level`.
    pub fn record_overflow(&self, level: Level) {
        self.overflow.with_label_values(&[level.as_str()]).inc();
    }

    fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.requests_total.clone()),
            Box::new(self.requests_failed.clone()),
            Box::new(self.events_total.clone()),
            Box::new(self.events_processed.clone()),
            Box::new(self.bytes_ingested.clone()),
            Box::new(self.events_too_late.clone()),
            Box::new(self.overflow.clone()),
        ]
    }
}

/// Counters updated by harvest runs.
#[derive(Debug, Clone)]
pub struct HarvestMetrics {
    /// Records published.
    pub records_total: IntCounter,
    /// Window harvests that failed and will be retried.
    pub failures_total: IntCounter,
    /// Entries skipped because they could not be decoded.
    pub corrupt_entries_total: IntCounter,
    /// Windows published and reclaimed.
    pub windows_total: IntCounter,
}

impl HarvestMetrics {
    /// Creates unregistered counters.
    ///
    /// # Errors
    ///
    /// Returns a telemetry error if a metric descriptor is invalid.
    pub fn new() -> Result<Self> {
        Ok(Self {
            records_total: IntCounter::new("harvest_records_total", "Records published")?,
            failures_total: IntCounter::new(
                "harvest_failures_total",
                "Window harvests that failed",
            )?,
            corrupt_entries_total: IntCounter::new(
                "harvest_corrupt_entries_total",
                "Buffered entries skipped as corrupt",
            )?,
            windows_total: IntCounter::new(
                "harvest_windows_total",
                "Windows published and reclaimed",
            )?,
        })
    }

    /// Creates the counters and registers them on `registry`.
    ///
    /// # Errors
    ///
    /// Returns a telemetry error if a metric is already registered.
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self::new()?;
        for collector in [
            &metrics.records_total,
            &metrics.failures_total,
            &metrics.corrupt_entries_total,
            &metrics.windows_total,
        ] {
            registry.register(Box::new(collector.clone()))?;
        }
        Ok(metrics)
    }
}

/// Gauges mirroring [`StoreStats`].
#[derive(Debug, Clone)]
struct StoreGauges {
    flushes: IntGauge,
    flushed_bytes: IntGauge,
    compactions: IntGauge,
    compacted_bytes_read: IntGauge,
    compacted_bytes_written: IntGauge,
    ingested_bytes: IntGauge,
    memtable_size_bytes: IntGauge,
    disk_usage_bytes: IntGauge,
    read_amplification: IntGauge,
    tables: IntGauge,
    pending_compaction_bytes: IntGauge,
    tombstones: IntGauge,
}

impl StoreGauges {
    fn new() -> Result<Self> {
        let gauge = |name: &str, help: &str| IntGauge::new(format!("buffer_store_{name}"), help);
        Ok(Self {
            flushes: gauge("flushes", "Durable flushes performed")?,
            flushed_bytes: gauge("flushed_bytes", "Bytes made durable by flushes")?,
            compactions: gauge("compactions", "Background compactions")?,
            compacted_bytes_read: gauge("compacted_bytes_read", "Bytes read by compactions")?,
            compacted_bytes_written: gauge(
                "compacted_bytes_written",
                "Bytes written by compactions",
            )?,
            ingested_bytes: gauge("ingested_bytes", "Key and value bytes written")?,
            memtable_size_bytes: gauge("memtable_size_bytes", "Bytes written but not flushed")?,
            disk_usage_bytes: gauge("disk_usage_bytes", "Engine files size on disk")?,
            read_amplification: gauge(
                "read_amplification",
                "Engine reads per merge-write, in hundredths",
            )?,
            tables: gauge("tables", "Engine trees")?,
            pending_compaction_bytes: gauge(
                "pending_compaction_bytes",
                "Disk space not occupied by live entries",
            )?,
            tombstones: gauge("tombstones", "Keys deleted by window reclaims")?,
        })
    }

    fn all(&self) -> [&IntGauge; 12] {
        [
            &self.flushes,
            &self.flushed_bytes,
            &self.compactions,
            &self.compacted_bytes_read,
            &self.compacted_bytes_written,
            &self.ingested_bytes,
            &self.memtable_size_bytes,
            &self.disk_usage_bytes,
            &self.read_amplification,
            &self.tables,
            &self.pending_compaction_bytes,
            &self.tombstones,
        ]
    }

    fn set(&self, stats: &StoreStats) {
        let values = [
            stats.flushes,
            stats.flushed_bytes,
            stats.compactions,
            stats.compacted_bytes_read,
            stats.compacted_bytes_written,
            stats.ingested_bytes,
            stats.memtable_size_bytes,
            stats.disk_usage_bytes,
            stats.read_amplification,
            stats.tables,
            stats.pending_compaction_bytes,
            stats.tombstones,
        ];
        for (gauge, value) in self.all().into_iter().zip(values) {
            gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
        }
    }
}

type StatsProvider = Box<dyn Fn() -> StoreStats + Send + Sync>;

/// Periodically copies storage statistics into registered gauges.
///
/// # Example
///
/// ```rust
/// use prometheus::Registry;
/// use rollup::store::StoreStats;
/// use rollup::telemetry::StatsSampler;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = Registry::new();
/// let sampler = StatsSampler::register(&registry, || StoreStats {
///     flushes: 3,
///     ..StoreStats::default()
/// })?;
/// sampler.sample();
/// assert_eq!(registry.gather().len(), 12);
///
/// drop(sampler);
/// assert!(registry.gather().is_empty());
/// # Ok(())
/// # }
/// ```
pub struct StatsSampler {
    registry: Registry,
    gauges: StoreGauges,
    provider: StatsProvider,
}

impl fmt::Debug for StatsSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsSampler")
            .field("gauges", &self.gauges)
            .finish_non_exhaustive()
    }
}

impl StatsSampler {
    /// Registers the storage gauges and remembers the snapshot function.
    ///
    /// # Errors
    ///
    /// Returns a telemetry error if a gauge is already registered; gauges
    /// registered before the failure are unregistered again.
    pub fn register<F>(registry: &Registry, provider: F) -> Result<Self>
    where
        F: Fn() -> StoreStats + Send + Sync + 'static,
    {
        let gauges = StoreGauges::new()?;
        for (i, gauge) in gauges.all().into_iter().enumerate() {
            if let Err(e) = registry.register(Box::new(gauge.clone())) {
                for registered in &gauges.all()[..i] {
                    let _ = registry.unregister(Box::new((*registered).clone()));
                }
                return Err(e.into());
            }
        }
        Ok(Self {
            registry: registry.clone(),
            gauges,
            provider: Box::new(provider),
        })
    }

    /// Takes one snapshot and updates the gauges.
    pub fn sample(&self) -> StoreStats {
        let stats = (self.provider)();
        self.gauges.set(&stats);
        stats
    }

    /// Samples every `period` until `cancel` fires.
    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = self.sample();
                    debug!(disk_usage_bytes = stats.disk_usage_bytes, "sampled store stats");
                }
            }
        }
    }
}

impl Drop for StatsSampler {
    fn drop(&mut self) {
        for gauge in self.gauges.all() {
            if let Err(e) = self.registry.unregister(Box::new(gauge.clone())) {
                warn!(error = %e, "failed to unregister store gauge");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn value_of(registry: &Registry, name: &str) -> Option<f64> {
        registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == name)
            .and_then(|family| family.get_metric().first().map(|m| {
                if m.has_gauge() {
                    m.get_gauge().get_value()
                } else {
                    m.get_counter().get_value()
                }
            }))
    }

    #[test]
    fn test_aggregator_metrics_register() {
        let registry = Registry::new();
        let metrics = AggregatorMetrics::register(&registry).unwrap();
        metrics.events_total.inc_by(3);
        metrics.record_overflow(Level::Transaction);

        assert_eq!(value_of(&registry, "aggregator_events_total"), Some(3.0));
        assert_eq!(
            metrics
                .overflow
                .with_label_values(&["transaction"])
                .get(),
            1
        );

        // Double registration is rejected
        assert!(AggregatorMetrics::register(&registry).is_err());
    }

    #[test]
    fn test_sampler_pulls_on_sample() {
        let registry = Registry::new();
        let flushes = Arc::new(AtomicU64::new(0));
        let source = Arc::clone(&flushes);
        let sampler = StatsSampler::register(&registry, move || StoreStats {
            flushes: source.load(Ordering::SeqCst),
            ..StoreStats::default()
        })
        .unwrap();

        flushes.store(7, Ordering::SeqCst);
        // Not pushed until sampled
        assert_eq!(value_of(&registry, "buffer_store_flushes"), Some(0.0));
        sampler.sample();
        assert_eq!(value_of(&registry, "buffer_store_flushes"), Some(7.0));
    }

    #[test]
    fn test_sampler_unregisters_on_drop() {
        let registry = Registry::new();
        let sampler = StatsSampler::register(&registry, StoreStats::default).unwrap();
        assert_eq!(registry.gather().len(), 12);
        drop(sampler);
        assert!(registry.gather().is_empty());

        // Registering again succeeds once released
        assert!(StatsSampler::register(&registry, StoreStats::default).is_ok());
    }

    #[test]
    fn test_failed_registration_rolls_back() {
        let registry = Registry::new();
        let taken = IntGauge::new("buffer_store_tables", "taken").unwrap();
        registry.register(Box::new(taken)).unwrap();

        assert!(StatsSampler::register(&registry, StoreStats::default).is_err());
        assert_eq!(registry.gather().len(), 1);
    }

    #[tokio::test]
    async fn test_sampler_run_stops_on_cancel() {
        let registry = Registry::new();
        let sampler = StatsSampler::register(&registry, || StoreStats {
            tombstones: 4,
            ..StoreStats::default()
        })
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        sampler.run(Duration::from_millis(10), cancel).await;
    }
}
