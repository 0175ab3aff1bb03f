//! Harvesting of closed windows.
//!
//! A harvest moves one window of one interval through
//! `Idle → Scanning → Finalizing → Publishing → Reclaiming → Idle`:
//!
//! 1. **Scanning** seals the window (waiting out in-flight writers), persists
//!    the new seal watermark, and reads its contiguous key range.
//! 2. **Finalizing** decodes each entry into a [`MetricRecord`]. Entries that
//!    fail to decode are logged, counted, and skipped.
//! 3. **Publishing** hands the ordered batch to the [`Sink`].
//! 4. **Reclaiming** deletes the window, only after the sink acknowledged.
//!
//! A failure or cancellation before Reclaiming leaves the window buffered, so
//! the next attempt rescans it from scratch and publishes identical records.
//! Windows of one interval are always harvested oldest first; the oldest
//! buffered window is the derived checkpoint, so a restarted process catches
//! up in order without any persisted cursor.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::clock::Clock;
use crate::config::IntervalConfig;
use crate::error::{HarvestError, Result, RollupError};
use crate::limiter::Limiter;
use crate::record::MetricRecord;
use crate::sink::Sink;
use crate::store::BufferStore;
use crate::telemetry::HarvestMetrics;
use crate::window::{IntervalWindow, WindowGates};

/// Entries scanned between cancellation checks.
const CANCEL_CHECK_EVERY: usize = 1024;

/// Largest backoff multiplier applied to the harvest tick.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Phase of an interval's harvester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestState {
    /// Waiting for a window to close.
    Idle,
    /// Reading the window's entries.
    Scanning,
    /// Decoding entries into records.
    Finalizing,
    /// Waiting for the sink to acknowledge.
    Publishing,
    /// Deleting the published window.
    Reclaiming,
}

/// Outcome of one successful window harvest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowReport {
    /// Interval harvested.
    pub interval: Duration,
    /// Window start in nanoseconds.
    pub window_start: u64,
    /// Records published.
    pub records: usize,
    /// Entries skipped as corrupt.
    pub corrupt: usize,
    /// Entries deleted.
    pub reclaimed: usize,
}

#[derive(Debug)]
struct Backoff {
    failures: u32,
    retry_at: u64,
}

#[derive(Debug)]
struct IntervalHarvest {
    /// Held for the duration of a run: one active run per interval.
    run: Mutex<Backoff>,
    state: Mutex<HarvestState>,
}

/// Finalizes closed windows and publishes them to a sink.
pub struct Harvester {
    store: Arc<BufferStore>,
    limiter: Arc<Limiter>,
    gates: Arc<WindowGates>,
    clock: Arc<dyn Clock>,
    sink: Box<dyn Sink>,
    metrics: HarvestMetrics,
    tick: Duration,
    intervals: Vec<IntervalHarvest>,
}

impl std::fmt::Debug for Harvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harvester")
            .field("tick", &self.tick)
            .field("intervals", &self.intervals)
            .finish_non_exhaustive()
    }
}

impl Harvester {
    /// Creates a harvester sharing the aggregator's store, gates and limiter.
    pub fn new(aggregator: &Aggregator, sink: Box<dyn Sink>, metrics: HarvestMetrics) -> Self {
        let intervals = aggregator
            .gates()
            .iter()
            .map(|_| IntervalHarvest {
                run: Mutex::new(Backoff {
                    failures: 0,
                    retry_at: 0,
                }),
                state: Mutex::new(HarvestState::Idle),
            })
            .collect();

        Self {
            store: Arc::clone(aggregator.store()),
            limiter: Arc::clone(aggregator.limiter()),
            gates: Arc::clone(aggregator.gates()),
            clock: Arc::clone(aggregator.clock()),
            sink,
            metrics,
            tick: aggregator.config().harvest_tick,
            intervals,
        }
    }

    /// Current phase of an interval's harvester.
    pub fn state(&self, interval: Duration) -> Option<HarvestState> {
        let index = self.gates.iter().position(|w| w.config.interval == interval)?;
        Some(*self.intervals[index].state.lock())
    }

    /// Harvests one window regardless of whether it has closed.
    ///
    /// # Errors
    ///
    /// - [`HarvestError::UnknownInterval`] if the interval is not configured
    /// - [`HarvestError::Cancelled`] if `cancel` fired before publishing
    /// - [`HarvestError::Publish`] if the sink did not acknowledge
    /// - a store error if the scan or delete failed
    ///
    /// In every error case the window stays buffered.
    pub fn harvest_window(
        &self,
        interval: Duration,
        window_start: u64,
        cancel: &CancellationToken,
    ) -> Result<WindowReport> {
        let (index, window) = self
            .gates
            .iter()
            .enumerate()
            .find(|(_, w)| w.config.interval == interval)
            .ok_or(HarvestError::UnknownInterval { interval })?;

        let slot = &self.intervals[index];
        let _run = slot.run.lock();
        let result = self.run_window(slot, window, window_start, cancel);
        *slot.state.lock() = HarvestState::Idle;
        result
    }

    /// Harvests, oldest first, every buffered window whose grace period has
    /// elapsed.
    ///
    /// Intervals that failed recently are skipped until their backoff
    /// expires. A failure stops that interval for this run; other intervals
    /// still proceed.
    ///
    /// # Errors
    ///
    /// Returns the first failure after every interval was attempted.
    pub fn harvest_ready(&self, cancel: &CancellationToken) -> Result<Vec<WindowReport>> {
        self.harvest_where(cancel, true)
    }

    /// Harvests every buffered window, open or not, oldest first.
    ///
    /// Open windows are sealed, so later events for them are rejected as late.
    ///
    /// # Errors
    ///
    /// Returns the first failure after every interval was attempted.
    pub fn harvest_all(&self, cancel: &CancellationToken) -> Result<Vec<WindowReport>> {
        self.harvest_where(cancel, false)
    }

    /// Runs [`harvest_ready`](Self::harvest_ready) every tick until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let harvester = Arc::clone(&self);
                    let token = cancel.clone();
                    let outcome =
                        tokio::task::spawn_blocking(move || harvester.harvest_ready(&token)).await;
                    match outcome {
                        Ok(Ok(reports)) if !reports.is_empty() => {
                            debug!(windows = reports.len(), "harvest tick complete");
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "harvest tick failed"),
                        Err(e) => error!(error = %e, "harvest task panicked"),
                    }
                }
            }
        }
        debug!("harvester stopped");
    }

    fn harvest_where(&self, cancel: &CancellationToken, only_ready: bool) -> Result<Vec<WindowReport>> {
        let mut reports = Vec::new();
        let mut first_error: Option<RollupError> = None;

        for (index, window) in self.gates.iter().enumerate() {
            let slot = &self.intervals[index];
            let mut backoff = slot.run.lock();
            let now = self.clock.now_ns();
            if only_ready && now < backoff.retry_at {
                debug!(interval = ?window.config.interval, "harvest backing off");
                continue;
            }

            match self.harvest_interval(slot, window, now, only_ready, cancel, &mut reports) {
                Ok(()) => {
                    backoff.failures = 0;
                    backoff.retry_at = 0;
                }
                Err(e) => {
                    if !matches!(e, RollupError::Harvest(HarvestError::Cancelled { .. })) {
                        backoff.failures = backoff.failures.saturating_add(1);
                        backoff.retry_at = now.saturating_add(self.backoff_delay(backoff.failures));
                        warn!(
                            interval = ?window.config.interval,
                            failures = backoff.failures,
                            error = %e,
                            "harvest failed; window stays buffered"
                        );
                    }
                    first_error.get_or_insert(e);
                }
            }
            drop(backoff);

            if cancel.is_cancelled() {
                break;
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    /// Harvests the windows of one interval in order. The caller holds the run lock.
    fn harvest_interval(
        &self,
        slot: &IntervalHarvest,
        window: &IntervalWindow,
        now: u64,
        only_ready: bool,
        cancel: &CancellationToken,
        reports: &mut Vec<WindowReport>,
    ) -> Result<()> {
        let interval_ms = window.config.interval_ms();
        let windows = if only_ready {
            Vec::new()
        } else {
            self.store.windows(interval_ms)?
        };
        let mut pending = windows.into_iter();

        loop {
            let next = if only_ready {
                self.store
                    .oldest_window(interval_ms)?
                    .filter(|&start| window.config.harvest_at(start) <= now)
            } else {
                pending.next()
            };
            let Some(window_start) = next else {
                return Ok(());
            };

            let result = self.run_window(slot, window, window_start, cancel);
            *slot.state.lock() = HarvestState::Idle;
            reports.push(result?);

            if cancel.is_cancelled() {
                return Ok(());
            }
        }
    }

    fn run_window(
        &self,
        slot: &IntervalHarvest,
        window: &IntervalWindow,
        window_start: u64,
        cancel: &CancellationToken,
    ) -> Result<WindowReport> {
        let config: &IntervalConfig = &window.config;
        let interval = config.interval;
        let interval_ms = config.interval_ms();
        let cancelled = || -> RollupError {
            HarvestError::Cancelled {
                interval,
                window_start,
            }
            .into()
        };

        // Scanning
        *slot.state.lock() = HarvestState::Scanning;
        let window_end = window_start.saturating_add(config.interval_ns());
        window.gate.seal(window_end);
        self.store.record_seal(interval_ms, window_end)?;
        let mut entries = Vec::new();
        for (i, entry) in self.store.scan_window(interval_ms, window_start).enumerate() {
            if i % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
                return Err(cancelled());
            }
            entries.push(entry?);
        }

        // Finalizing
        *slot.state.lock() = HarvestState::Finalizing;
        let mut records = Vec::with_capacity(entries.len());
        let mut corrupt = 0usize;
        for entry in &entries {
            match entry.decode() {
                Ok((key, value)) => records.push(MetricRecord::from_entry(&key, &value)),
                Err(e) => {
                    corrupt += 1;
                    error!(
                        interval = ?interval,
                        window_start,
                        key = ?entry.key_bytes(),
                        error = %e,
                        "skipping corrupt buffered entry"
                    );
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        // Publishing
        *slot.state.lock() = HarvestState::Publishing;
        if !records.is_empty() {
            if let Err(e) = self.sink.publish(&records) {
                self.metrics.failures_total.inc();
                return Err(HarvestError::Publish {
                    interval,
                    window_start,
                    source: Box::new(e),
                }
                .into());
            }
        }

        // Reclaiming
        *slot.state.lock() = HarvestState::Reclaiming;
        let reclaimed = self.store.delete_window(interval_ms, window_start)?;
        self.limiter.forget_window(interval_ms, window_start);

        self.metrics.records_total.inc_by(records.len() as u64);
        self.metrics.corrupt_entries_total.inc_by(corrupt as u64);
        self.metrics.windows_total.inc();
        info!(
            interval = ?interval,
            window_start,
            records = records.len(),
            corrupt,
            "harvested window"
        );

        Ok(WindowReport {
            interval,
            window_start,
            records: records.len(),
            corrupt,
            reclaimed,
        })
    }

    #[allow(clippy::cast_possible_truncation)] // tick checked by `AggregatorConfig::validate`
    fn backoff_delay(&self, failures: u32) -> u64 {
        let exponent = failures.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        (self.tick.as_nanos() as u64).saturating_mul(1 << exponent)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AggregatorConfig;
    use crate::event::{ApmEvent, Outcome};
    use crate::sink::MemorySink;
    use crate::telemetry::AggregatorMetrics;

    const MINUTE: Duration = Duration::from_secs(60);
    const MINUTE_NS: u64 = 60_000_000_000;
    const T0: u64 = 1_000 * MINUTE_NS;

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        aggregator: Aggregator,
        sink: Arc<MemorySink>,
        harvester: Harvester,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = AggregatorConfig {
            intervals: vec![IntervalConfig::new(MINUTE, Duration::from_secs(5)).unwrap()],
            harvest_tick: Duration::from_secs(1),
            ..AggregatorConfig::default()
        };
        let store = Arc::new(BufferStore::open(dir.path().join("store"), &config).unwrap());
        let clock = Arc::new(ManualClock::new(T0));
        let aggregator =
            Aggregator::new(config, store, clock.clone(), AggregatorMetrics::new().unwrap())
                .unwrap();
        let sink = Arc::new(MemorySink::new());
        let harvester = Harvester::new(
            &aggregator,
            Box::new(Arc::clone(&sink)),
            HarvestMetrics::new().unwrap(),
        );
        Fixture {
            _dir: dir,
            clock,
            aggregator,
            sink,
            harvester,
        }
    }

    fn tx(ts: u64, name: &str) -> ApmEvent {
        ApmEvent::transaction(ts, "svc", "request", name, 100, Outcome::Success)
    }

    #[test]
    fn test_harvest_ready_waits_for_grace() {
        let f = fixture();
        f.aggregator.add(&tx(T0, "a")).unwrap();
        let cancel = CancellationToken::new();

        f.clock.set(T0 + MINUTE_NS + 4_000_000_000);
        assert!(f.harvester.harvest_ready(&cancel).unwrap().is_empty());

        f.clock.set(T0 + MINUTE_NS + 5_000_000_000);
        let reports = f.harvester.harvest_ready(&cancel).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].records, 4);
        assert_eq!(reports[0].reclaimed, 4);
        assert!(f.aggregator.store().is_empty());
        assert_eq!(f.sink.records().len(), 4);
        assert_eq!(f.harvester.state(MINUTE), Some(HarvestState::Idle));
    }

    #[test]
    fn test_failed_publish_keeps_window_and_backs_off() {
        let f = fixture();
        f.aggregator.add(&tx(T0, "a")).unwrap();
        let cancel = CancellationToken::new();
        f.sink.fail_next(1);

        f.clock.set(T0 + 2 * MINUTE_NS);
        let err = f.harvester.harvest_ready(&cancel).unwrap_err();
        assert!(matches!(
            err,
            RollupError::Harvest(HarvestError::Publish { .. })
        ));
        assert_eq!(f.aggregator.store().len(), 4);

        // Backing off: nothing attempted within the first tick
        assert!(f.harvester.harvest_ready(&cancel).unwrap().is_empty());
        assert_eq!(f.aggregator.store().len(), 4);

        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.harvester.harvest_ready(&cancel).unwrap().len(), 1);
        assert!(f.aggregator.store().is_empty());
    }

    #[test]
    fn test_cancelled_harvest_deletes_nothing() {
        let f = fixture();
        f.aggregator.add(&tx(T0, "a")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .harvester
            .harvest_window(MINUTE, T0, &cancel)
            .unwrap_err();
        assert!(matches!(
            err,
            RollupError::Harvest(HarvestError::Cancelled { .. })
        ));
        assert_eq!(f.aggregator.store().len(), 4);
        assert!(f.sink.records().is_empty());
    }

    #[test]
    fn test_harvest_all_seals_open_windows() {
        let f = fixture();
        f.aggregator.add(&tx(T0, "a")).unwrap();
        f.aggregator.add(&tx(T0 + 1, "b")).unwrap();

        let reports = f.harvester.harvest_all(&CancellationToken::new()).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(f.aggregator.store().is_empty());

        // The window is sealed now, in memory and on disk
        assert!(f.aggregator.add(&tx(T0 + 2, "a")).is_err());
        assert_eq!(
            f.aggregator.store().sealed_before(60_000).unwrap(),
            Some(T0 + MINUTE_NS)
        );
    }

    #[test]
    fn test_unknown_interval() {
        let f = fixture();
        let err = f
            .harvester
            .harvest_window(Duration::from_secs(7), 0, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            RollupError::Harvest(HarvestError::UnknownInterval { .. })
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let f = fixture();
        let tick = 1_000_000_000u64;
        assert_eq!(f.harvester.backoff_delay(1), tick);
        assert_eq!(f.harvester.backoff_delay(2), 2 * tick);
        assert_eq!(f.harvester.backoff_delay(4), 8 * tick);
        assert_eq!(f.harvester.backoff_delay(100), 64 * tick);
    }
}
