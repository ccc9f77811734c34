use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backfill_utils::split_delivery;
use chrono::Utc;
use data_model::{BackfillRequest, GapNotice};
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

/// Calls the device as soon as an edge-side detection reports a gap,
/// without the delay queue. Failed calls are handed to the retry queue.
pub struct DirectBackfill {
    device_rpc: Arc<dyn DeviceRpc>,
    retry_queue: Arc<Queue>,
    timers: TimerConfig,
    metrics: pipeline::Metrics,
}

impl DirectBackfill {
    pub fn new(device_rpc: Arc<dyn DeviceRpc>, retry_queue: Arc<Queue>, timers: TimerConfig) -> Self {
        Self {
            device_rpc,
            retry_queue,
            timers,
            metrics: pipeline::Metrics::default(),
        }
    }

    /// A failed call is enqueued for the retry handler. Failure to enqueue
    /// is logged only; the call itself already happened.
    #[instrument(skip_all, fields(batch_id = %request.batch_id))]
    pub async fn dispatch(&self, request: &BackfillRequest) -> MethodResponse {
        let response = self.device_rpc.invoke_backfill(request).await;
        self.metrics.device_calls.add(
            1,
            &[
                KeyValue::new("component", Component::DirectBackfill.to_string()),
                KeyValue::new("status_class", status_class(response.status)),
            ],
        );
        if response.is_success() {
            info!(
                component = %Component::DirectBackfill,
                %request,
                status = response.status,
                "backfill device method accepted"
            );
            return response;
        }

        warn!(
            component = %Component::DirectBackfill,
            %request,
            status = response.status,
            "backfill device method failed, handing over to the retry queue"
        );
        let options = SendOptions {
            ttl: self.timers.data_gaps_ttl(),
            visibility_delay: self.timers.backfill_retry_visibility(),
        };
        match self.retry_queue.send_json(request, options).await {
            Ok(()) => info!(
                component = %Component::DirectBackfill,
                %request,
                "backfill request enqueued for retry"
            ),
            Err(err) => error!(
                component = %Component::DirectBackfill,
                %request,
                "error enqueueing backfill request for retry: {:#}",
                err
            ),
        }
        response
    }

    async fn handle_message(&self, message: &str) -> Result<()> {
        let notice: GapNotice = serde_json::from_str(message)
            .with_context(|| format!("invalid gap notice: {message}"))?;
        let request = notice.into_request(Utc::now());
        info!(component = %Component::DirectBackfill, %request, "received gap notice");
        self.dispatch(&request).await;
        Ok(())
    }
}

#[async_trait]
impl BatchHandler for DirectBackfill {
    fn component(&self) -> Component {
        Component::DirectBackfill
    }

    async fn handle_batch(&self, deliveries: &[String]) -> Result<()> {
        let mut errors = Vec::new();
        for message in deliveries.iter().flat_map(|d| split_delivery(d)) {
            if let Err(err) = self.handle_message(message).await {
                error!(
                    component = %Component::DirectBackfill,
                    message,
                    "error processing gap notice: {:#}",
                    err
                );
                errors.push(err);
            }
        }
        raise_collected(Component::DirectBackfill, errors)
    }
}

#[cfg(test)]
mod tests {
    use data_model::Windowed;
    use serde_json::json;

    use super::*;
    use crate::test_doubles::tests::*;

    fn notice() -> String {
        json!({
            "deviceID": "batch_a",
            "previousLastTsInBatch": "2024-05-01T10:05:00Z",
            "currfirstTsInBatch": "2024-05-01T10:07:00Z",
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_success_does_not_enqueue() {
        let rpc = ScriptedDeviceRpc::succeeding();
        let (queue, sent) = recording_queue("backfill-retries");
        let direct = DirectBackfill::new(rpc.clone(), queue, TimerConfig::default());

        direct.handle_batch(&[notice()]).await.unwrap();

        assert_eq!(rpc.call_count(), 1);
        let (request, _) = &rpc.calls()[0];
        assert_eq!(request.batch_id, "batch_a");
        assert_eq!(request.duration_secs(), 120);
        assert!(sent.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_failure_enqueues_for_retry() {
        let rpc = ScriptedDeviceRpc::failing(500);
        let (queue, sent) = recording_queue("backfill-retries");
        let direct = DirectBackfill::new(rpc.clone(), queue, TimerConfig::default());

        direct.handle_batch(&[notice()]).await.unwrap();

        let retried: Vec<BackfillRequest> = sent.decoded();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0], rpc.calls()[0].0);
        let options = sent.options()[0];
        let timers = TimerConfig::default();
        assert_eq!(options.visibility_delay, timers.backfill_retry_visibility());
        assert_eq!(options.ttl, timers.data_gaps_ttl());
    }

    #[tokio::test]
    async fn test_enqueue_failure_is_swallowed() {
        let direct = DirectBackfill::new(
            ScriptedDeviceRpc::failing(503),
            failing_queue("backfill-retries"),
            TimerConfig::default(),
        );
        direct.handle_batch(&[notice()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_notice_fails_the_batch() {
        let rpc = ScriptedDeviceRpc::succeeding();
        let (queue, _) = recording_queue("backfill-retries");
        let direct = DirectBackfill::new(rpc.clone(), queue, TimerConfig::default());

        let err = direct
            .handle_batch(&[format!("{{\"deviceID\":\"x\"}}\n{}", notice())])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid gap notice"));
        assert_eq!(rpc.call_count(), 1);
    }
}
