//! Ingestion-facing aggregation.
//!
//! For each event the [`Aggregator`] derives one key per hierarchy level and
//! configured interval, runs every identity through the [`Limiter`], builds
//! the event's single-event [`MetricValue`], and merges it into the
//! [`BufferStore`]. All keys of an event (or of a batch) are merged first and
//! made durable with a single sync; the call returns only after that sync.
//!
//! # Late and future events
//!
//! An event contributes to an interval only while its window is open: the
//! window must not have been sealed by the harvester and
//! `window_end + harvest_delay` must lie in the future. Intervals whose
//! window closed are skipped and counted; if every interval is skipped the
//! event is rejected with [`AggregateError::TooLate`]. Events more than
//! `max_future` ahead of the clock are rejected with
//! [`AggregateError::InFuture`].

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::AggregatorConfig;
use crate::error::{AggregateError, Result, RollupError, StoreError};
use crate::event::{ApmEvent, EventKind};
use crate::key::{self, AggregationKey, Level, PartKind};
use crate::limiter::{Admission, Limiter};
use crate::sketch::hash_identity;
use crate::store::BufferStore;
use crate::telemetry::AggregatorMetrics;
use crate::value::MetricValue;
use crate::window::{IntervalWindow, WindowGates, WindowHold};

/// Result of [`Aggregator::add_batch`].
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Events durably merged into at least one interval.
    pub accepted: usize,
    /// Events that were not (fully) merged, by position in the batch.
    pub rejected: Vec<(usize, RollupError)>,
    /// Whether the batch stopped early because it was cancelled.
    pub cancelled: bool,
}

/// Merges events into the buffer store.
///
/// # Thread Safety
///
/// `add` and `add_batch` take `&self` and may be called from many threads at
/// once; share the aggregator behind an `Arc`.
#[derive(Debug)]
pub struct Aggregator {
    config: AggregatorConfig,
    store: Arc<BufferStore>,
    limiter: Arc<Limiter>,
    gates: Arc<WindowGates>,
    clock: Arc<dyn Clock>,
    metrics: AggregatorMetrics,
    /// `true` once closed. Callers hold the read side for the whole call.
    closed: RwLock<bool>,
}

/// One key an event contributes to.
struct Contribution {
    key: AggregationKey,
    overflow_identity: Option<u64>,
    /// The key's identity was admitted for this event.
    fresh: bool,
}

impl Aggregator {
    /// Creates an aggregator over `store`.
    ///
    /// Admission state is restored from the keys already buffered, and each
    /// interval's gate from its persisted seal watermark, so a restarted
    /// process keeps admitting the same identities and never reopens a
    /// reclaimed window.
    ///
    /// # Errors
    ///
    /// Returns a config error if validation fails, or a store error if the
    /// buffered keys or watermarks cannot be read.
    pub fn new(
        config: AggregatorConfig,
        store: Arc<BufferStore>,
        clock: Arc<dyn Clock>,
        metrics: AggregatorMetrics,
    ) -> Result<Self> {
        config.validate()?;

        let limiter = Limiter::new(config.limits);
        let keys = store.keys()?;
        let restored = limiter.restore(&keys);
        if restored > 0 {
            debug!(restored, "restored admitted identities from buffer store");
        }

        let gates = WindowGates::new(&config.intervals);
        for window in gates.iter() {
            if let Some(sealed_before) = store.sealed_before(window.config.interval_ms())? {
                window.gate.seal(sealed_before);
                debug!(
                    interval = ?window.config.interval,
                    sealed_before,
                    "restored seal watermark"
                );
            }
        }

        Ok(Self {
            gates: Arc::new(gates),
            limiter: Arc::new(limiter),
            config,
            store,
            clock,
            metrics,
            closed: RwLock::new(false),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// The buffer store events are merged into.
    pub fn store(&self) -> &Arc<BufferStore> {
        &self.store
    }

    /// Admission state shared with the harvester.
    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }

    /// Window gates shared with the harvester.
    pub fn gates(&self) -> &Arc<WindowGates> {
        &self.gates
    }

    /// Clock used for window decisions.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Merges one event and waits until it is durable.
    ///
    /// # Errors
    ///
    /// - [`AggregateError::Closed`] after [`close`](Self::close)
    /// - [`AggregateError::InFuture`] / [`AggregateError::TooLate`] for out-of-range timestamps
    /// - [`AggregateError::PartialFailure`] if some keys failed; the others were merged
    /// - a store error if the final sync fails
    pub fn add(&self, event: &ApmEvent) -> Result<()> {
        let closed = self.closed.read();
        if *closed {
            return Err(AggregateError::Closed.into());
        }
        self.metrics.requests_total.inc();
        self.count_received(event);

        // Holds outlive the sync, so a seal also waits for durability
        let holds = self.gates.hold_all();
        let result = self
            .merge_event(event, self.clock.now_ns(), &holds)
            .and_then(|()| self.store.sync().map(|_| ()));
        drop(holds);

        match &result {
            Ok(()) => self.metrics.events_processed.inc(),
            Err(e) => {
                self.metrics.requests_failed.inc();
                debug!(service = %event.service, error = %e, "event rejected");
            }
        }
        result
    }

    /// Merges a batch of events with a single durable sync.
    ///
    /// Failures are reported per event. If `cancel` fires, the remaining
    /// events are left unprocessed and the batch reports `cancelled`; events
    /// merged before that point are still synced.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Closed`] after [`close`](Self::close).
    pub fn add_batch(&self, events: &[ApmEvent], cancel: &CancellationToken) -> Result<BatchReport> {
        let closed = self.closed.read();
        if *closed {
            return Err(AggregateError::Closed.into());
        }
        self.metrics.requests_total.inc();

        let mut report = BatchReport::default();
        let mut merged = Vec::with_capacity(events.len());
        let now = self.clock.now_ns();
        let holds = self.gates.hold_all();
        for (index, event) in events.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.count_received(event);
            match self.merge_event(event, now, &holds) {
                Ok(()) => merged.push(index),
                Err(e) => report.rejected.push((index, e)),
            }
        }

        if !merged.is_empty() {
            if let Err(e) = self.store.sync() {
                warn!(error = %e, events = merged.len(), "sync failed for batch");
                let reason = e.to_string();
                for index in merged.drain(..) {
                    let error = StoreError::Unsynced {
                        reason: reason.clone(),
                    };
                    report.rejected.push((index, error.into()));
                }
            }
        }
        drop(holds);

        report.accepted = merged.len();
        self.metrics.events_processed.inc_by(merged.len() as u64);
        if !report.rejected.is_empty() {
            self.metrics.requests_failed.inc();
            report.rejected.sort_by_key(|(index, _)| *index);
        }
        Ok(report)
    }

    /// Stops accepting events and waits for in-flight calls to finish.
    pub fn close(&self) {
        let mut closed = self.closed.write();
        *closed = true;
    }

    /// Returns `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    fn count_received(&self, event: &ApmEvent) {
        self.metrics.events_total.inc();
        self.metrics.bytes_ingested.inc_by(event.size_bytes() as u64);
    }

    /// Merges every key of `event` without syncing.
    ///
    /// Keys are derived for every open interval before anything is merged, so
    /// an event that cannot be keyed leaves the store untouched.
    fn merge_event(
        &self,
        event: &ApmEvent,
        now: u64,
        holds: &[(&IntervalWindow, WindowHold<'_>)],
    ) -> Result<()> {
        let max_future = self.config.max_future;
        let horizon = now.saturating_add(self.config.max_future_ns());
        if event.timestamp_ns > horizon {
            return Err(AggregateError::InFuture {
                timestamp: event.timestamp_ns,
                now,
                max_future,
            }
            .into());
        }

        let mut contributions = Vec::with_capacity(holds.len() * 4);
        let mut open_intervals = 0usize;
        for (window, hold) in holds {
            let interval = &window.config;
            let window_start = interval.window_start(event.timestamp_ns);
            if interval.harvest_at(window_start) <= now || !hold.admits(window_start) {
                self.metrics.events_too_late.inc();
                continue;
            }
            open_intervals += 1;

            if let Err(e) =
                self.derive_keys(interval.interval_ms(), window_start, event, &mut contributions)
            {
                self.release_unwritten(&contributions, &[]);
                return Err(e);
            }
        }

        if open_intervals == 0 {
            return Err(AggregateError::TooLate {
                timestamp: event.timestamp_ns,
            }
            .into());
        }

        let base = MetricValue::from_event(event, &self.config.histogram);
        let mut written = Vec::with_capacity(contributions.len());
        let mut first_error: Option<RollupError> = None;
        for contribution in &contributions {
            let value = match contribution.overflow_identity {
                Some(hash) => base.clone().with_overflow_identity(hash, &self.config.sketch),
                None => base.clone(),
            };
            match self.store.merge_unsynced(&contribution.key.encode(), &value) {
                Ok(()) => written.push(true),
                Err(e) => {
                    warn!(key = %contribution.key, error = %e, "merge-write failed");
                    written.push(false);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(first) => {
                self.release_unwritten(&contributions, &written);
                Err(AggregateError::PartialFailure {
                    failed: written.iter().filter(|&&ok| !ok).count(),
                    total: contributions.len(),
                    first: Box::new(first),
                }
                .into())
            }
        }
    }

    /// Returns the quota of fresh admissions that own nothing in the store.
    ///
    /// An admission owns something if its own write or a write below it in
    /// the same interval landed. `written` is shorter than `contributions`
    /// when merging never started.
    fn release_unwritten(&self, contributions: &[Contribution], written: &[bool]) {
        let landed = |i: usize| written.get(i).copied().unwrap_or(false);
        for (i, contribution) in contributions.iter().enumerate() {
            if !contribution.fresh || landed(i) {
                continue;
            }
            let interval_ms = contribution.key.interval_ms();
            let below_landed = contributions
                .iter()
                .enumerate()
                .skip(i + 1)
                .any(|(j, c)| landed(j) && c.key.interval_ms() == interval_ms);
            if !below_landed && self.limiter.release(&contribution.key) {
                debug!(key = %contribution.key, "released admission of unwritten key");
            }
        }
    }

    /// Derives the effective key of every level the event contributes to in
    /// one window, appending them to `out` parent first.
    fn derive_keys(
        &self,
        interval_ms: u32,
        window_start: u64,
        event: &ApmEvent,
        out: &mut Vec<Contribution>,
    ) -> Result<()> {
        let global = AggregationKey::global(interval_ms, window_start);
        let partition = key::partition_for(&event.service, self.config.partitions);
        let service = event.service.as_str();

        out.push(Contribution {
            key: global.clone(),
            overflow_identity: None,
            fresh: false,
        });

        let admission = self
            .limiter
            .admit(&global, PartKind::Service, service, partition)?;
        let service_key = self.push(out, admission, &[service]);

        match event.kind {
            EventKind::Transaction => {
                let tx_type = event.event_type.as_str();
                let admission =
                    self.limiter
                        .admit(&service_key, PartKind::TransactionType, tx_type, partition)?;
                let type_key = self.push(out, admission, &[service, tx_type]);

                // Names are counted per service across types
                let admission = self.limiter.admit(
                    &type_key,
                    PartKind::TransactionName,
                    &event.name,
                    partition,
                )?;
                self.push(out, admission, &[service, tx_type, &event.name]);
            }
            EventKind::Span => {
                if let Some(destination) = event.destination.as_deref() {
                    let admission = self.limiter.admit(
                        &service_key,
                        PartKind::SpanTarget,
                        destination,
                        partition,
                    )?;
                    self.push(out, admission, &[service, destination]);
                }
            }
        }

        Ok(())
    }

    /// Records an admission and returns its key as the parent of the next level.
    fn push(
        &self,
        out: &mut Vec<Contribution>,
        admission: Admission,
        lineage: &[&str],
    ) -> AggregationKey {
        let overflow_identity = if admission.is_overflow() {
            self.metrics.record_overflow(admission.key().level());
            Some(lineage_hash(lineage))
        } else {
            None
        };
        let fresh = admission.is_new();
        let key = admission.into_key();
        out.push(Contribution {
            key: key.clone(),
            overflow_identity,
            fresh,
        });
        key
    }
}

/// Hashes the real identity chain of an overflowed key.
fn lineage_hash(lineage: &[&str]) -> u64 {
    let mut bytes = Vec::with_capacity(lineage.iter().map(|s| s.len() + 4).sum());
    for part in lineage {
        #[allow(clippy::cast_possible_truncation)] // identity names are far below 4 GiB
        bytes.extend_from_slice(&(part.len() as u32).to_le_bytes());
        bytes.extend_from_slice(part.as_bytes());
    }
    hash_identity(&bytes)
}

/// Levels an event of the given shape contributes to.
pub fn levels_for(event: &ApmEvent) -> Vec<Level> {
    match event.kind {
        EventKind::Transaction => vec![
            Level::Global,
            Level::Service,
            Level::ServiceTransaction,
            Level::Transaction,
        ],
        EventKind::Span if event.destination.is_some() => {
            vec![Level::Global, Level::Service, Level::Span]
        }
        EventKind::Span => vec![Level::Global, Level::Service],
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{IntervalConfig, LimitsConfig};
    use crate::event::Outcome;
    use crate::key::KeyPart;

    const MINUTE_NS: u64 = 60_000_000_000;
    const T0: u64 = 1_000 * MINUTE_NS;

    fn config() -> AggregatorConfig {
        AggregatorConfig {
            intervals: vec![
                IntervalConfig::new(Duration::from_secs(60), Duration::from_secs(5)).unwrap(),
                IntervalConfig::new(Duration::from_secs(600), Duration::from_secs(5)).unwrap(),
            ],
            sketch: crate::config::SketchConfig { precision: 10 },
            ..AggregatorConfig::default()
        }
    }

    fn setup(config: AggregatorConfig) -> (TempDir, Arc<ManualClock>, Aggregator) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(BufferStore::open(dir.path().join("store"), &config).unwrap());
        let clock = Arc::new(ManualClock::new(T0 + 1));
        let aggregator = Aggregator::new(
            config,
            store,
            clock.clone(),
            AggregatorMetrics::new().unwrap(),
        )
        .unwrap();
        (dir, clock, aggregator)
    }

    fn tx(ts: u64, service: &str, name: &str) -> ApmEvent {
        ApmEvent::transaction(ts, service, "request", name, 1_000, Outcome::Success)
    }

    #[test]
    fn test_transaction_contributes_to_every_level() {
        let (_dir, _clock, aggregator) = setup(config());
        aggregator.add(&tx(T0, "checkout-api", "POST /pay")).unwrap();

        // Four levels in each of two intervals
        assert_eq!(aggregator.store().len(), 8);
        let levels: Vec<Level> = aggregator
            .store()
            .scan_window(60_000, T0)
            .map(|e| e.unwrap().decode().unwrap().0.level())
            .collect();
        assert_eq!(levels, levels_for(&tx(T0, "a", "b")));
    }

    #[test]
    fn test_span_levels() {
        let (_dir, _clock, aggregator) = setup(config());
        let span = ApmEvent::span(T0, "svc", "SELECT", "postgres", 10, Outcome::Success);
        aggregator.add(&span).unwrap();
        assert_eq!(aggregator.store().scan_window(60_000, T0).count(), 3);

        let mut internal = span.clone();
        internal.destination = None;
        aggregator.add(&internal).unwrap();
        assert_eq!(aggregator.store().scan_window(60_000, T0).count(), 3);

        let service = aggregator
            .store()
            .scan_window(60_000, T0)
            .map(|e| e.unwrap().decode().unwrap())
            .find(|(k, _)| k.level() == Level::Service)
            .unwrap();
        assert_eq!(service.1.count(), 2);
    }

    #[test]
    fn test_future_and_late_events() {
        let (_dir, clock, aggregator) = setup(config());

        let err = aggregator.add(&tx(T0 + 2 * MINUTE_NS, "a", "b")).unwrap_err();
        assert!(matches!(
            err,
            RollupError::Aggregate(AggregateError::InFuture { .. })
        ));

        // Past the 1m window's grace but inside the 10m window
        clock.set(T0 + MINUTE_NS + 5_000_000_000);
        aggregator.add(&tx(T0, "a", "b")).unwrap();
        assert_eq!(aggregator.store().scan_window(60_000, T0).count(), 0);
        assert_eq!(aggregator.store().scan_window(600_000, T0).count(), 4);
        assert_eq!(aggregator.metrics.events_too_late.get(), 1);

        // Past every window
        clock.set(T0 + 20 * MINUTE_NS);
        let err = aggregator.add(&tx(T0, "a", "b")).unwrap_err();
        assert!(matches!(
            err,
            RollupError::Aggregate(AggregateError::TooLate { .. })
        ));
        assert_eq!(aggregator.metrics.requests_failed.get(), 2);
    }

    #[test]
    fn test_sealed_window_rejects_writes() {
        let (_dir, _clock, aggregator) = setup(config());
        for window in aggregator.gates().iter() {
            window.gate.seal(T0 + window.config.interval_ns());
        }
        let err = aggregator.add(&tx(T0, "a", "b")).unwrap_err();
        assert!(matches!(
            err,
            RollupError::Aggregate(AggregateError::TooLate { .. })
        ));
        assert!(aggregator.store().is_empty());
    }

    #[test]
    fn test_overflow_carries_sketch() {
        let mut config = config();
        config.limits = LimitsConfig {
            max_transaction_groups_per_service: 2,
            ..LimitsConfig::default()
        };
        let (_dir, _clock, aggregator) = setup(config);
        for i in 0..5 {
            aggregator.add(&tx(T0, "svc", &format!("GET /{i}"))).unwrap();
        }

        let transactions: Vec<(AggregationKey, MetricValue)> = aggregator
            .store()
            .scan_window(60_000, T0)
            .map(|e| e.unwrap().decode().unwrap())
            .filter(|(k, _)| k.level() == Level::Transaction)
            .collect();
        assert_eq!(transactions.len(), 3);

        let (_, overflow) = transactions.iter().find(|(k, _)| k.is_overflow()).unwrap();
        assert_eq!(overflow.count(), 3);
        assert!(overflow.overflow_estimate().unwrap().abs_diff(3) <= 1);
        assert!(transactions
            .iter()
            .filter(|(k, _)| !k.is_overflow())
            .all(|(_, v)| v.count() == 1 && v.sketch().is_none()));
        assert_eq!(
            aggregator
                .metrics
                .overflow
                .with_label_values(&["transaction"])
                .get(),
            6
        );
    }

    #[test]
    fn test_add_batch() {
        let (_dir, _clock, aggregator) = setup(config());
        let events = vec![
            tx(T0, "a", "x"),
            tx(T0 + 10 * MINUTE_NS, "a", "x"),
            tx(T0, "b", "y"),
        ];
        let report = aggregator
            .add_batch(&events, &CancellationToken::new())
            .unwrap();
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, 1);
        assert!(!report.cancelled);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = aggregator.add_batch(&events, &cancel).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.accepted, 0);
    }

    #[test]
    fn test_close_rejects_new_events() {
        let (_dir, _clock, aggregator) = setup(config());
        aggregator.add(&tx(T0, "a", "b")).unwrap();
        aggregator.close();
        assert!(aggregator.is_closed());
        assert!(matches!(
            aggregator.add(&tx(T0, "a", "b")),
            Err(RollupError::Aggregate(AggregateError::Closed))
        ));
        assert!(aggregator
            .add_batch(&[tx(T0, "a", "b")], &CancellationToken::new())
            .is_err());
    }

    fn transactions_in(aggregator: &Aggregator, window: u64) -> Vec<AggregationKey> {
        aggregator
            .store()
            .scan_window(60_000, window)
            .filter_map(|e| AggregationKey::decode(e.unwrap().key_bytes()).ok())
            .filter(|k| k.level() == Level::Transaction)
            .collect()
    }

    #[test]
    fn test_names_limited_per_service_across_types() {
        let mut config = config();
        config.limits.max_transaction_groups_per_service = 2;
        let (_dir, _clock, aggregator) = setup(config);
        for (tx_type, name) in [("request", "a"), ("request", "b"), ("job", "c"), ("worker", "d")] {
            let event = ApmEvent::transaction(T0, "svc", tx_type, name, 10, Outcome::Success);
            aggregator.add(&event).unwrap();
        }

        let keys = transactions_in(&aggregator, T0);
        assert_eq!(keys.iter().filter(|k| !k.is_overflow()).count(), 2);
        // One overflow slot under each type that hit the limit
        assert_eq!(keys.iter().filter(|k| k.is_overflow()).count(), 2);
    }

    #[test]
    fn test_failed_write_releases_fresh_admission() {
        let mut config = config();
        config.limits.max_transaction_groups_per_service = 1;
        let (_dir, _clock, aggregator) = setup(config);

        let name_key = |name: &str| {
            AggregationKey::global(60_000, T0)
                .child(KeyPart::named(PartKind::Service, "svc"), 0)
                .unwrap()
                .child(KeyPart::named(PartKind::TransactionType, "request"), 0)
                .unwrap()
                .child(KeyPart::named(PartKind::TransactionName, name), 0)
                .unwrap()
        };
        aggregator
            .store()
            .insert_raw(&name_key("a").encode(), &[9, 9, 9]);

        let err = aggregator.add(&tx(T0, "svc", "a")).unwrap_err();
        assert!(matches!(
            err,
            RollupError::Aggregate(AggregateError::PartialFailure { failed: 1, .. })
        ));

        // "a" never owned anything in the 1m window, so "b" gets the slot
        aggregator.add(&tx(T0, "svc", "b")).unwrap();
        let keys = transactions_in(&aggregator, T0);
        assert!(keys.contains(&name_key("b")));
        assert!(keys.iter().all(|k| !k.is_overflow()));
    }

    #[test]
    fn test_unmerged_contributions_release_everything() {
        let (_dir, _clock, aggregator) = setup(config());
        let event = tx(T0, "svc", "a");
        let mut contributions = Vec::new();
        aggregator
            .derive_keys(60_000, T0, &event, &mut contributions)
            .unwrap();
        assert_eq!(contributions.len(), 4);
        assert_eq!(contributions.iter().filter(|c| c.fresh).count(), 3);

        aggregator.release_unwritten(&contributions, &[]);
        assert_eq!(aggregator.limiter().scope_count(), 0);
        assert!(aggregator.store().is_empty());
    }

    #[test]
    fn test_seal_waits_for_batch_sync() {
        let config = AggregatorConfig {
            intervals: vec![IntervalConfig::new(Duration::from_secs(60), Duration::from_secs(5)).unwrap()],
            ..AggregatorConfig::default()
        };
        let (_dir, _clock, aggregator) = setup(config);
        let aggregator = Arc::new(aggregator);

        let writer = {
            let aggregator = Arc::clone(&aggregator);
            std::thread::spawn(move || loop {
                let events: Vec<ApmEvent> = (0..50).map(|i| tx(T0, "svc", &format!("GET /{i}"))).collect();
                let report = aggregator
                    .add_batch(&events, &CancellationToken::new())
                    .unwrap();
                if report.accepted == 0 {
                    break;
                }
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        let window = aggregator.gates().iter().next().unwrap();
        window.gate.seal(T0 + MINUTE_NS);
        // Every write that got in before the seal is already durable
        assert_eq!(aggregator.store().stats().memtable_size_bytes, 0);
        writer.join().unwrap();
    }

    #[test]
    fn test_lineage_hash_distinguishes_boundaries() {
        assert_ne!(lineage_hash(&["ab", "c"]), lineage_hash(&["a", "bc"]));
        assert_eq!(lineage_hash(&["a", "b"]), lineage_hash(&["a", "b"]));
    }
}
