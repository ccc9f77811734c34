use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backfill_utils::split_delivery;
use data_model::{BackfillRequest, DataGap};
use gap_engine::{GapEngine, LedgerInsert};
use metrics::{pipeline, status_class};
use opentelemetry::KeyValue;
use tracing::{error, info, instrument, warn};

use crate::{
    device_rpc::{DeviceRpc, MethodResponse},
    queue::{Queue, SendOptions},
    raise_collected,
    runner::BatchHandler,
    Component,
    TimerConfig,
};

/// Dispatches backfill requests to their device and schedules a follow-up
/// check of the requested window.
pub struct BackfillExecutor {
    gap_engine: Arc<GapEngine>,
    device_rpc: Arc<dyn DeviceRpc>,
    gap_queue: Arc<Queue>,
    timers: TimerConfig,
    metrics: pipeline::Metrics,
}

impl BackfillExecutor {
    pub fn new(
        gap_engine: Arc<GapEngine>,
        device_rpc: Arc<dyn DeviceRpc>,
        gap_queue: Arc<Queue>,
        timers: TimerConfig,
    ) -> Self {
        Self {
            gap_engine,
            device_rpc,
            gap_queue,
            timers,
            metrics: pipeline::Metrics::default(),
        }
    }

    /// Records the request in the ledger, calls the device and enqueues the
    /// follow-up gap regardless of the device's answer. The follow-up
    /// re-enters the pipeline once the lease-sized delay has passed, so a
    /// failed call is retried and a successful one is verified.
    #[instrument(skip_all, fields(batch_id = %request.batch_id))]
    pub async fn execute(&self, request: &BackfillRequest) -> Result<MethodResponse> {
        if let LedgerInsert::Conflict = self.gap_engine.record_active_request(request).await? {
            warn!(
                component = %Component::BackfillExecutor,
                %request,
                "backfill request already in the ledger, dispatching again"
            );
        }

        let response = self.device_rpc.invoke_backfill(request).await;
        self.metrics.device_calls.add(
            1,
            &[
                KeyValue::new("component", Component::BackfillExecutor.to_string()),
                KeyValue::new("status_class", status_class(response.status)),
            ],
        );
        if response.is_success() {
            info!(
                component = %Component::BackfillExecutor,
                %request,
                status = response.status,
                "backfill device method accepted"
            );
        } else {
            warn!(
                component = %Component::BackfillExecutor,
                %request,
                status = response.status,
                payload = %response.payload,
                "backfill device method failed, the follow-up check will retry"
            );
        }

        let follow_up = DataGap::follow_up(request);
        let options = SendOptions {
            ttl: self.timers.data_gaps_ttl(),
            visibility_delay: self.timers.detection_retry_invisible(),
        };
        self.gap_queue
            .send_json(&follow_up, options)
            .await
            .with_context(|| format!("scheduling follow-up check {follow_up}"))?;
        info!(
            component = %Component::BackfillExecutor,
            gap = %follow_up,
            "scheduled follow-up check"
        );
        Ok(response)
    }

    async fn handle_message(&self, message: &str) -> Result<()> {
        let request: BackfillRequest = serde_json::from_str(message)
            .with_context(|| format!("invalid backfill request: {message}"))?;
        self.execute(&request).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchHandler for BackfillExecutor {
    fn component(&self) -> Component {
        Component::BackfillExecutor
    }

    async fn handle_batch(&self, deliveries: &[String]) -> Result<()> {
        let mut errors = Vec::new();
        for message in deliveries.iter().flat_map(|d| split_delivery(d)) {
            if let Err(err) = self.handle_message(message).await {
                error!(
                    component = %Component::BackfillExecutor,
                    message,
                    "error executing backfill request: {:#}",
                    err
                );
                errors.push(err);
            }
        }
        raise_collected(Component::BackfillExecutor, errors)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{SubsecRound, Utc};
    use data_model::test_objects::tests::{at, mock_request, TEST_BATCH};
    use gap_engine::test_gap_engine::in_memory_engine;

    use super::*;
    use crate::{test_doubles::tests::*, AggregateError};

    /// Created on a whole microsecond, the precision the ledger keeps.
    fn request() -> BackfillRequest {
        mock_request(TEST_BATCH, at(10, 5), at(10, 7), Utc::now().trunc_subsecs(6))
    }

    #[tokio::test]
    async fn test_dispatch_records_calls_and_schedules_follow_up() {
        let engine = Arc::new(in_memory_engine().await.unwrap());
        let rpc = ScriptedDeviceRpc::succeeding();
        let (queue, sent) = recording_queue("data-gaps");
        let executor = BackfillExecutor::new(engine.clone(), rpc.clone(), queue, TimerConfig::default());

        let request = request();
        executor.handle_batch(&[request.to_string()]).await.unwrap();

        assert_eq!(rpc.call_count(), 1);
        assert_eq!(rpc.calls()[0].0, request);
        let active = engine
            .find_active_request(&request, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(active, Some(request.clone()));

        let follow_ups: Vec<DataGap> = sent.decoded();
        assert_eq!(follow_ups, vec![DataGap::follow_up(&request)]);
        assert_eq!(follow_ups[0].gap_in_seconds, 120);
        let options = sent.options()[0];
        assert_eq!(options.visibility_delay, TimerConfig::default().detection_retry_invisible());
        assert_eq!(options.ttl, TimerConfig::default().data_gaps_ttl());
    }

    #[tokio::test]
    async fn test_device_failure_still_schedules_follow_up() {
        let engine = Arc::new(in_memory_engine().await.unwrap());
        let (queue, sent) = recording_queue("data-gaps");
        let executor = BackfillExecutor::new(
            engine,
            ScriptedDeviceRpc::failing(504),
            queue,
            TimerConfig::default(),
        );

        let response = executor.execute(&request()).await.unwrap();
        assert_eq!(response.status, 504);
        assert_eq!(sent.bodies().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_request_is_dispatched_again() {
        let engine = Arc::new(in_memory_engine().await.unwrap());
        let rpc = ScriptedDeviceRpc::succeeding();
        let (queue, sent) = recording_queue("data-gaps");
        let executor = BackfillExecutor::new(engine, rpc.clone(), queue, TimerConfig::default());

        let request = request();
        executor.execute(&request).await.unwrap();
        executor.execute(&request).await.unwrap();
        assert_eq!(rpc.call_count(), 2);
        assert_eq!(sent.bodies().len(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_collected_across_the_batch() {
        let engine = Arc::new(in_memory_engine().await.unwrap());
        let rpc = ScriptedDeviceRpc::succeeding();
        let executor = BackfillExecutor::new(
            engine,
            rpc.clone(),
            failing_queue("data-gaps"),
            TimerConfig::default(),
        );

        let first = request();
        let second = mock_request(TEST_BATCH, at(11, 0), at(11, 2), Utc::now());
        let delivery = format!("{first}\n{second}");
        let err = executor.handle_batch(&[delivery]).await.unwrap_err();

        // Both requests reached the device before the failures surfaced.
        assert_eq!(rpc.call_count(), 2);
        let aggregate = err.downcast_ref::<AggregateError>().unwrap();
        assert_eq!(aggregate.errors.len(), 2);
        assert_eq!(aggregate.component, Component::BackfillExecutor);
    }
}
