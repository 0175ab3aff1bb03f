//! # rollup
//!
//! Durable pre-aggregation of APM events into bounded-cardinality,
//! time-windowed metrics.
//!
//! rollup sits between an APM ingest pipeline and a metrics backend. Every
//! transaction or span event is folded into aggregates at several hierarchy
//! levels (global, service, service + transaction type, transaction, span
//! target) and several interval lengths. Aggregates live in an embedded
//! ordered key-value store until their window closes, then a harvester turns
//! each window into finalized [`MetricRecord`]s and hands them to a [`Sink`].
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Durable before acknowledged: `add` returns only after the merged
//!   aggregates are synced to disk
//! - Exactly-once publication per window across restarts: a window is deleted
//!   only after the sink accepted it, and re-harvesting is deterministic
//! - Bounded cardinality: identities beyond per-scope limits fold into an
//!   overflow slot that still counts every event and estimates how many
//!   distinct identities it absorbed
//! - Commutative, associative merges: concurrent writers and arbitrary event
//!   order produce identical aggregates
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rollup::{Aggregator, AggregatorConfig, ApmEvent, BufferStore, Harvester, Outcome};
//! use rollup::clock::SystemClock;
//! use rollup::sink::JsonLinesSink;
//! use rollup::telemetry::{AggregatorMetrics, HarvestMetrics};
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AggregatorConfig::default();
//! let store = Arc::new(BufferStore::open("./buffer", &config)?);
//! let aggregator = Aggregator::new(config, store, Arc::new(SystemClock), AggregatorMetrics::new()?)?;
//!
//! // Merge an event (durable on return)
//! let now = 1_700_000_041_000_000_000;
//! aggregator.add(&ApmEvent::transaction(now, "checkout-api", "request", "POST /pay",
//!     1_250, Outcome::Success))?;
//!
//! // Publish every window whose grace period has elapsed
//! let sink = JsonLinesSink::new(std::io::stdout());
//! let harvester = Harvester::new(&aggregator, Box::new(sink), HarvestMetrics::new()?);
//! for report in harvester.harvest_ready(&CancellationToken::new())? {
//!     println!("{} records from window {}", report.records, report.window_start);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Aggregator`]: derives keys, applies limits, merges into the store
//! - [`BufferStore`]: durable map from [`AggregationKey`] to [`MetricValue`]
//! - [`Harvester`]: finalizes closed windows and publishes them
//! - [`AggregationService`]: wires everything together with background tasks
//!
//! ## Modules
//!
//! - [`key`]: Aggregation key model and ordered binary codec
//! - [`value`]: Mergeable metric value and its binary codec
//! - [`histogram`] / [`sketch`]: Latency histogram and distinct-count sketch
//! - [`limiter`]: Per-scope cardinality limits and overflow redirection
//! - [`store`]: Durable buffer store
//! - [`window`]: Window sealing between writers and the harvester
//! - [`record`] / [`sink`]: Finalized output and its destinations
//! - [`telemetry`]: Prometheus counters and storage gauges
//! - [`config`] / [`error`]: Configuration and error types

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod harvest;
pub mod histogram;
pub mod key;
pub mod limiter;
pub mod record;
#[cfg(feature = "prometheus-remote-write")]
pub mod remote_write;
pub mod service;
pub mod sink;
pub mod sketch;
pub mod store;
pub mod telemetry;
pub mod value;
pub mod window;

// Re-export primary API types at crate root for convenience.
pub use aggregator::{Aggregator, BatchReport};
pub use config::{AggregatorConfig, IntervalConfig, LimitsConfig};
pub use error::{Result, RollupError};
pub use event::{ApmEvent, EventKind, Outcome};
pub use harvest::{HarvestState, Harvester, WindowReport};
pub use key::{AggregationKey, Level};
pub use record::MetricRecord;
pub use service::AggregationService;
pub use sink::Sink;
pub use store::BufferStore;
pub use value::MetricValue;
