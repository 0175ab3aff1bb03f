//! Finalized output records.
//!
//! A [`MetricRecord`] is the denormalized form of one harvested key: the
//! hierarchy chain becomes explicit dimension fields, the histogram becomes
//! percentiles plus raw buckets, and overflow keys expose their estimated
//! distinct-identity count. Building a record is a pure function of the key
//! and value, so re-harvesting an unchanged window yields identical records.

use serde::{Deserialize, Serialize};

use crate::histogram::Histogram;
use crate::key::{AggregationKey, Identity, Level, PartKind};
use crate::value::MetricValue;

/// Dimension value reported for an overflow slot.
pub const OVERFLOW_MARKER: &str = "_other";

/// Latency distribution of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Sum of durations in microseconds.
    pub sum_us: u64,
    /// Median estimate.
    pub p50_us: Option<u64>,
    /// 95th percentile estimate.
    pub p95_us: Option<u64>,
    /// 99th percentile estimate.
    pub p99_us: Option<u64>,
    /// Populated buckets in ascending order.
    pub buckets: Vec<BucketCount>,
}

/// One populated histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCount {
    /// Smallest duration in the bucket (inclusive).
    pub lower_us: u64,
    /// Largest duration in the bucket (inclusive).
    pub upper_us: u64,
    /// Number of events in the bucket.
    pub count: u64,
}

impl LatencySummary {
    fn from_histogram(histogram: &Histogram) -> Self {
        Self {
            sum_us: histogram.sum_us(),
            p50_us: histogram.percentile(0.50),
            p95_us: histogram.percentile(0.95),
            p99_us: histogram.percentile(0.99),
            buckets: histogram
                .buckets()
                .map(|b| BucketCount {
                    lower_us: b.lower,
                    upper_us: b.upper,
                    count: b.count,
                })
                .collect(),
        }
    }
}

/// One harvested aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Interval length in milliseconds.
    pub interval_ms: u32,
    /// Window start in nanoseconds since the Unix epoch.
    pub window_start_ns: u64,
    /// Hierarchy level.
    pub level: Level,
    /// Service name, or [`OVERFLOW_MARKER`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Transaction type, or [`OVERFLOW_MARKER`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<String>,
    /// Transaction name, or [`OVERFLOW_MARKER`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_name: Option<String>,
    /// Span destination, or [`OVERFLOW_MARKER`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_target: Option<String>,
    /// Whether this record aggregates identities beyond a cardinality limit.
    pub overflow: bool,
    /// Events aggregated.
    pub count: u64,
    /// Successful events.
    pub success_count: u64,
    /// Failed events.
    pub failure_count: u64,
    /// Events with unknown outcome.
    pub unknown_count: u64,
    /// Latency distribution.
    pub latency: LatencySummary,
    /// Estimated distinct identities folded into an overflow record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overflow_distinct_estimate: Option<u64>,
}

impl MetricRecord {
    /// Finalizes one buffered entry.
    pub fn from_entry(key: &AggregationKey, value: &MetricValue) -> Self {
        let mut record = Self {
            interval_ms: key.interval_ms(),
            window_start_ns: key.window_start(),
            level: key.level(),
            service: None,
            transaction_type: None,
            transaction_name: None,
            span_target: None,
            overflow: key.is_overflow(),
            count: value.count(),
            success_count: value.success_count(),
            failure_count: value.failure_count(),
            unknown_count: value.unknown_count(),
            latency: LatencySummary::from_histogram(value.histogram()),
            overflow_distinct_estimate: value.overflow_estimate(),
        };

        for part in key.chain() {
            let dimension = match &part.identity {
                Identity::Named(name) => name.clone(),
                Identity::Overflow => OVERFLOW_MARKER.to_string(),
            };
            let field = match part.kind {
                PartKind::Service => &mut record.service,
                PartKind::TransactionType => &mut record.transaction_type,
                PartKind::TransactionName => &mut record.transaction_name,
                PartKind::SpanTarget => &mut record.span_target,
            };
            *field = Some(dimension);
        }
        record
    }

    /// Dimension pairs in hierarchy order, for label-based sinks.
    pub fn dimensions(&self) -> Vec<(&'static str, &str)> {
        [
            ("service", &self.service),
            ("transaction_type", &self.transaction_type),
            ("transaction_name", &self.transaction_name),
            ("span_target", &self.span_target),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|v| (name, v)))
        .collect()
    }
}
