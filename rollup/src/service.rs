//! Service lifecycle: wiring, background tasks and ordered shutdown.
//!
//! [`AggregationService`] opens the buffer store, builds the aggregator and
//! harvester over it, registers telemetry, and spawns two background tasks:
//! the harvest loop and the statistics sampler. Shutdown runs in a fixed
//! order:
//!
//! ```text
//! close aggregator ─► cancel tasks ─► final harvest ─► drop sampler ─► sync store
//! (no new events)     (await exit)    (closed windows)  (unregister)    (durable)
//! ```
//!
//! Windows still open at shutdown stay buffered and are harvested by the next
//! process to open the store.

use std::path::Path;
use std::sync::Arc;

use prometheus::Registry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::{Aggregator, BatchReport};
use crate::clock::{Clock, SystemClock};
use crate::config::AggregatorConfig;
use crate::error::Result;
use crate::event::ApmEvent;
use crate::harvest::Harvester;
use crate::sink::Sink;
use crate::store::BufferStore;
use crate::telemetry::{AggregatorMetrics, HarvestMetrics, StatsSampler};

/// A running aggregation pipeline.
#[derive(Debug)]
pub struct AggregationService {
    aggregator: Arc<Aggregator>,
    harvester: Arc<Harvester>,
    sampler: Arc<StatsSampler>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AggregationService {
    /// Starts the pipeline over the store at `path`, using the system clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the store cannot be
    /// opened, or telemetry registration fails.
    pub async fn start<P: AsRef<Path>>(
        path: P,
        config: AggregatorConfig,
        sink: Box<dyn Sink>,
        registry: &Registry,
    ) -> Result<Self> {
        Self::start_with_clock(path, config, sink, registry, Arc::new(SystemClock)).await
    }

    /// Starts the pipeline with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub async fn start_with_clock<P: AsRef<Path>>(
        path: P,
        config: AggregatorConfig,
        sink: Box<dyn Sink>,
        registry: &Registry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(BufferStore::open(path, &config)?);
        let harvest_tick = config.harvest_tick;
        let stats_period = config.stats_period;

        let aggregator = Arc::new(Aggregator::new(
            config,
            Arc::clone(&store),
            clock,
            AggregatorMetrics::register(registry)?,
        )?);
        let harvester = Arc::new(Harvester::new(
            &aggregator,
            sink,
            HarvestMetrics::register(registry)?,
        ));
        let sampler = {
            let store = Arc::clone(&store);
            Arc::new(StatsSampler::register(registry, move || store.stats())?)
        };

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(Arc::clone(&harvester).run(cancel.child_token())),
            tokio::spawn({
                let sampler = Arc::clone(&sampler);
                let token = cancel.child_token();
                async move { sampler.run(stats_period, token).await }
            }),
        ];

        info!(
            path = %store.path().display(),
            buffered = store.len(),
            tick = ?harvest_tick,
            "aggregation service started"
        );

        Ok(Self {
            aggregator,
            harvester,
            sampler,
            cancel,
            tasks,
        })
    }

    /// The aggregator accepting events.
    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// The harvester publishing closed windows.
    pub fn harvester(&self) -> &Arc<Harvester> {
        &self.harvester
    }

    /// Merges one event; see [`Aggregator::add`].
    ///
    /// # Errors
    ///
    /// Propagates the aggregator's error.
    pub async fn add(&self, event: ApmEvent) -> Result<()> {
        let aggregator = Arc::clone(&self.aggregator);
        tokio::task::spawn_blocking(move || aggregator.add(&event))
            .await
            .unwrap_or_else(|e| Err(panicked(&e)))
    }

    /// Merges a batch; see [`Aggregator::add_batch`].
    ///
    /// # Errors
    ///
    /// Propagates the aggregator's error.
    pub async fn add_batch(&self, events: Vec<ApmEvent>) -> Result<BatchReport> {
        let aggregator = Arc::clone(&self.aggregator);
        let cancel = self.cancel.child_token();
        tokio::task::spawn_blocking(move || aggregator.add_batch(&events, &cancel))
            .await
            .unwrap_or_else(|e| Err(panicked(&e)))
    }

    /// Stops the pipeline in order and makes everything durable.
    ///
    /// # Errors
    ///
    /// Returns the final sync error. A failed final harvest is logged only;
    /// its windows stay buffered.
    pub async fn shutdown(self) -> Result<()> {
        info!("aggregation service shutting down");
        let Self {
            aggregator,
            harvester,
            sampler,
            cancel,
            tasks,
        } = self;

        {
            let aggregator = Arc::clone(&aggregator);
            if let Err(e) = tokio::task::spawn_blocking(move || aggregator.close()).await {
                error!(error = %e, "closing aggregator panicked");
            }
        }

        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        let final_harvest = tokio::task::spawn_blocking(move || {
            let outcome = harvester.harvest_ready(&CancellationToken::new());
            drop(harvester);
            outcome
        })
        .await;
        match final_harvest {
            Ok(Ok(reports)) => info!(windows = reports.len(), "final harvest complete"),
            Ok(Err(e)) => warn!(error = %e, "final harvest failed; windows stay buffered"),
            Err(e) => error!(error = %e, "final harvest panicked"),
        }

        drop(sampler);

        let store = Arc::clone(aggregator.store());
        drop(aggregator);
        let synced = tokio::task::spawn_blocking(move || store.sync())
            .await
            .unwrap_or_else(|e| Err(panicked(&e)))?;
        info!(synced_bytes = synced, "aggregation service stopped");
        Ok(())
    }
}

fn panicked(e: &tokio::task::JoinError) -> crate::error::RollupError {
    crate::error::StoreError::Unsynced {
        reason: format!("blocking task failed: {e}"),
    }
    .into()
}
