use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use data_model::BackfillRequest;
use metrics::pipeline;
use opentelemetry::KeyValue;
use tracing::{error, info, instrument, warn};

use crate::{
    device_rpc::{DeviceRpc, MethodResponse},
    retry_policy::{FixedBackoff, RetryExhausted},
    runner::MessageHandler,
    Component,
};

/// Re-issues backfill requests whose direct call failed, on a fixed
/// backoff schedule.
pub struct RetryHandler {
    device_rpc: Arc<dyn DeviceRpc>,
    policy: FixedBackoff,
    metrics: pipeline::Metrics,
}

impl RetryHandler {
    pub fn new(device_rpc: Arc<dyn DeviceRpc>, policy: FixedBackoff) -> Self {
        Self {
            device_rpc,
            policy,
            metrics: pipeline::Metrics::default(),
        }
    }

    #[instrument(skip_all, fields(batch_id = %request.batch_id))]
    pub async fn retry(&self, request: &BackfillRequest) -> Result<MethodResponse> {
        let labels = [KeyValue::new("component", Component::RetryHandler.to_string())];
        let result = self
            .policy
            .run(|attempt| {
                self.metrics.retry_attempts.add(1, &labels);
                async move {
                    let response = self.device_rpc.invoke_backfill(request).await;
                    if !response.is_success() {
                        warn!(
                            component = %Component::RetryHandler,
                            %request,
                            attempt,
                            status = response.status,
                            "retried backfill device method failed"
                        );
                    }
                    response
                }
            })
            .await;
        match result {
            Ok(response) => {
                info!(
                    component = %Component::RetryHandler,
                    %request,
                    status = response.status,
                    "retried backfill device method accepted"
                );
                Ok(response)
            }
            Err(exhausted) => {
                error!(
                    component = %Component::RetryHandler,
                    %request,
                    attempts = exhausted.attempts,
                    "giving up on backfill request: {}",
                    exhausted
                );
                Err(exhausted.into())
            }
        }
    }
}

#[async_trait]
impl MessageHandler for RetryHandler {
    fn component(&self) -> Component {
        Component::RetryHandler
    }

    async fn handle_message(&self, body: &str) -> Result<()> {
        let request: BackfillRequest = serde_json::from_str(body)
            .with_context(|| format!("invalid backfill request: {body}"))?;
        info!(component = %Component::RetryHandler, %request, "retrying backfill request");
        self.retry(&request).await?;
        Ok(())
    }

    /// Exhaustion already ran the whole backoff schedule. Redelivering would
    /// restart it.
    fn is_terminal(&self, err: &anyhow::Error) -> bool {
        err.downcast_ref::<RetryExhausted>().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::test_objects::tests::{at, mock_request, TEST_BATCH};
    use tokio::{sync::watch, time::Instant};

    use super::*;
    use crate::{
        queue::{InMemoryQueue, QueueProducer, SendOptions},
        runner::{QueueRunner, RunnerConfig},
        test_doubles::tests::*,
    };

    fn request() -> BackfillRequest {
        mock_request(TEST_BATCH, at(10, 5), at(10, 7), at(10, 8))
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_attempt_succeeds() {
        let rpc = ScriptedDeviceRpc::new(&[503, 503], 200);
        let handler = RetryHandler::new(rpc.clone(), FixedBackoff::default());

        let start = Instant::now();
        handler
            .handle_message(&request().to_string())
            .await
            .unwrap();

        let offsets: Vec<u64> = rpc
            .calls()
            .iter()
            .map(|(_, at)| (*at - start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 10, 70]);
        assert!(rpc.calls().iter().all(|(r, _)| *r == request()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_invocation() {
        let rpc = ScriptedDeviceRpc::failing(503);
        let handler = RetryHandler::new(
            rpc.clone(),
            FixedBackoff::new(vec![Duration::from_secs(1), Duration::from_secs(2)]),
        );

        let err = handler
            .handle_message(&request().to_string())
            .await
            .unwrap_err();
        let exhausted = err.downcast_ref::<RetryExhausted>().unwrap();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.last_status, 503);
        assert_eq!(rpc.call_count(), 3);
        assert!(handler.is_terminal(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_request_is_not_redelivered() {
        let rpc = ScriptedDeviceRpc::failing(503);
        let handler = Arc::new(RetryHandler::new(rpc.clone(), FixedBackoff::default()));
        let (producer, consumer) =
            InMemoryQueue::channel("backfill-retries", Duration::from_secs(30), 5);
        let runner = Arc::new(QueueRunner::new(handler, consumer, RunnerConfig::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.start(shutdown_rx).await }
        });

        producer
            .send(
                request().to_string(),
                SendOptions {
                    ttl: Duration::from_secs(7 * 24 * 3600),
                    visibility_delay: Duration::from_secs(60),
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(rpc.call_count(), 4);
    }

    #[tokio::test]
    async fn test_invalid_message() {
        let handler = RetryHandler::new(ScriptedDeviceRpc::succeeding(), FixedBackoff::default());
        let err = handler.handle_message("{\"batchId\":1}").await.unwrap_err();
        assert!(err.to_string().contains("invalid backfill request"));
    }
}
