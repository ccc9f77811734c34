use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backfill_utils::split_delivery;
use data_model::{DataGap, OrphanSignal};
use gap_engine::GapEngine;
use metrics::pipeline;
use tracing::{error, info, instrument};

use crate::{
    queue::{Queue, SendOptions},
    raise_collected,
    runner::BatchHandler,
    Component,
    TimerConfig,
};

/// Turns orphan signals into scheduled data gaps.
pub struct GapDetector {
    gap_engine: Arc<GapEngine>,
    gap_queue: Arc<Queue>,
    timers: TimerConfig,
    metrics: pipeline::Metrics,
}

impl GapDetector {
    pub fn new(gap_engine: Arc<GapEngine>, gap_queue: Arc<Queue>, timers: TimerConfig) -> Self {
        Self {
            gap_engine,
            gap_queue,
            timers,
            metrics: pipeline::Metrics::default(),
        }
    }

    /// Finds the gaps of the signalled batch within the detection horizon
    /// and schedules each for processing once the initial detection delay
    /// has passed.
    ///
    /// Scheduling is best effort: a gap that cannot be enqueued is logged
    /// and left for the next signal of the batch to find again.
    #[instrument(skip_all, fields(batch_id = %signal.batch_id))]
    pub async fn detect(&self, signal: &OrphanSignal) -> Result<Vec<DataGap>> {
        let gaps = self
            .gap_engine
            .compute_gaps(&signal.batch_id, self.timers.data_gaps_ttl())
            .await?;
        info!(
            component = %Component::GapDetector,
            %signal,
            gaps = gaps.len(),
            "computed data gaps"
        );
        self.metrics.gaps_detected.add(gaps.len() as u64, &[]);

        let options = SendOptions {
            ttl: self.timers.data_gaps_ttl(),
            visibility_delay: self.timers.initial_detection_invisible(),
        };
        for gap in &gaps {
            match self.gap_queue.send_json(gap, options).await {
                Ok(()) => info!(component = %Component::GapDetector, %gap, "scheduled data gap"),
                Err(err) => {
                    self.metrics.gap_enqueue_failures.add(1, &[]);
                    error!(
                        component = %Component::GapDetector,
                        %gap,
                        "error scheduling data gap: {:#}",
                        err
                    );
                }
            }
        }
        Ok(gaps)
    }

    async fn handle_message(&self, message: &str) -> Result<()> {
        let signal: OrphanSignal = serde_json::from_str(message)
            .with_context(|| format!("invalid orphan signal: {message}"))?;
        self.detect(&signal).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchHandler for GapDetector {
    fn component(&self) -> Component {
        Component::GapDetector
    }

    async fn handle_batch(&self, deliveries: &[String]) -> Result<()> {
        let mut errors = Vec::new();
        for message in deliveries.iter().flat_map(|d| split_delivery(d)) {
            if let Err(err) = self.handle_message(message).await {
                error!(
                    component = %Component::GapDetector,
                    message,
                    "error processing orphan signal: {:#}",
                    err
                );
                errors.push(err);
            }
        }
        raise_collected(Component::GapDetector, errors)
    }
}
