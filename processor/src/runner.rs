use std::{ops::ControlFlow, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use metrics::{pipeline, Timer};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::{
    queue::{InMemoryConsumer, QueueMessage},
    stream::InMemoryStreamConsumer,
    Component,
};

/// Consumes batches of stream delivery units.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    fn component(&self) -> Component;

    async fn handle_batch(&self, deliveries: &[String]) -> Result<()>;
}

/// Consumes one queue message at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn component(&self) -> Component;

    async fn handle_message(&self, body: &str) -> Result<()>;

    /// Failures for which redelivery cannot help. The message is acked
    /// instead of handed back.
    fn is_terminal(&self, _err: &anyhow::Error) -> bool {
        false
    }
}

fn default_batch_size() -> usize {
    32
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_redelivery_backoff_ms() -> u64 {
    1000
}

fn default_queue_concurrency() -> usize {
    16
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Most delivery units handed to one stream invocation.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts at a stream batch before it is dropped.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,
    /// Queue messages handled at the same time by one runner.
    #[serde(default = "default_queue_concurrency")]
    pub queue_concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_deliveries: default_max_deliveries(),
            redelivery_backoff_ms: default_redelivery_backoff_ms(),
            queue_concurrency: default_queue_concurrency(),
        }
    }
}

impl RunnerConfig {
    pub fn redelivery_backoff(&self) -> Duration {
        Duration::from_millis(self.redelivery_backoff_ms)
    }
}

async fn invoke<F>(metrics: &pipeline::Metrics, component: Component, invocation: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let labels = [KeyValue::new("component", component.to_string())];
    let _timer = Timer::start_with_labels(&metrics.invocation_duration, &labels);
    let result = invocation.await;
    if result.is_err() {
        metrics.invocation_failures.add(1, &labels);
    }
    result
}

/// Feeds stream batches to a [`BatchHandler`]. A failed batch is handed
/// over again, whole, until it succeeds or runs out of deliveries; the
/// stream does not advance meanwhile.
pub struct StreamRunner<H: BatchHandler> {
    handler: Arc<H>,
    consumer: Mutex<InMemoryStreamConsumer>,
    config: RunnerConfig,
    metrics: pipeline::Metrics,
}

impl<H: BatchHandler> StreamRunner<H> {
    pub fn new(handler: Arc<H>, consumer: InMemoryStreamConsumer, config: RunnerConfig) -> Self {
        Self {
            handler,
            consumer: Mutex::new(consumer),
            config,
            metrics: pipeline::Metrics::default(),
        }
    }

    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        let component = self.handler.component();
        let mut consumer = self.consumer.lock().await;
        loop {
            tokio::select! {
                batch = consumer.receive_batch(self.config.batch_size) => {
                    let Some(batch) = batch else {
                        info!(%component, "stream closed, runner stopping");
                        break;
                    };
                    if self.deliver(component, batch, &mut shutdown_rx).await.is_break() {
                        info!(%component, "stream runner shutting down during redelivery");
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!(%component, "stream runner shutting down");
                    break;
                }
            }
        }
    }

    /// Breaks when shutdown arrives while waiting to redeliver.
    async fn deliver(
        &self,
        component: Component,
        batch: Vec<String>,
        shutdown_rx: &mut watch::Receiver<()>,
    ) -> ControlFlow<()> {
        let max_deliveries = self.config.max_deliveries.max(1);
        for delivery in 1..=max_deliveries {
            let result = invoke(&self.metrics, component, self.handler.handle_batch(&batch)).await;
            let Err(err) = result else {
                return ControlFlow::Continue(());
            };
            error!(
                %component,
                delivery,
                batch_size = batch.len(),
                "invocation failed: {:#}",
                err
            );
            if delivery < max_deliveries {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.redelivery_backoff()) => {},
                    _ = shutdown_rx.changed() => {
                        warn!(
                            %component,
                            delivery,
                            batch = ?batch,
                            "abandoning failed batch on shutdown"
                        );
                        return ControlFlow::Break(());
                    }
                }
            }
        }
        warn!(
            %component,
            deliveries = max_deliveries,
            batch = ?batch,
            "dropping batch after repeated failures"
        );
        ControlFlow::Continue(())
    }
}

/// Feeds queue messages to a [`MessageHandler`], several at a time. Failed
/// messages go back to the queue for redelivery unless the failure is
/// terminal.
pub struct QueueRunner<H: MessageHandler + 'static> {
    handler: Arc<H>,
    consumer: Mutex<InMemoryConsumer>,
    config: RunnerConfig,
    metrics: pipeline::Metrics,
}

impl<H: MessageHandler + 'static> QueueRunner<H> {
    pub fn new(handler: Arc<H>, consumer: InMemoryConsumer, config: RunnerConfig) -> Self {
        Self {
            handler,
            consumer: Mutex::new(consumer),
            config,
            metrics: pipeline::Metrics::default(),
        }
    }

    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        let component = self.handler.component();
        let permits = Arc::new(Semaphore::new(self.config.queue_concurrency.max(1)));
        let tracker = TaskTracker::new();
        let mut consumer = self.consumer.lock().await;
        loop {
            tokio::select! {
                message = consumer.receive() => {
                    let Some(message) = message else {
                        info!(%component, "queue closed, runner stopping");
                        break;
                    };
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let handler = self.handler.clone();
                    let metrics = self.metrics.clone();
                    let redelivery = consumer.redelivery();
                    tracker.spawn(async move {
                        let _permit = permit;
                        if let Err(message) = process(handler.as_ref(), &metrics, message).await {
                            redelivery.nack(message);
                        }
                    });
                },
                _ = shutdown_rx.changed() => {
                    info!(%component, "queue runner shutting down");
                    break;
                }
            }
        }
        tracker.close();
        tracker.wait().await;
    }
}

/// Hands the message back on failure, unless the handler deems the failure
/// terminal.
async fn process<H: MessageHandler>(
    handler: &H,
    metrics: &pipeline::Metrics,
    message: QueueMessage,
) -> Result<(), QueueMessage> {
    let component = handler.component();
    match invoke(metrics, component, handler.handle_message(&message.body)).await {
        Ok(()) => Ok(()),
        Err(err) if handler.is_terminal(&err) => {
            error!(
                %component,
                message_id = %message.id,
                dequeue_count = message.dequeue_count,
                body = %message.body,
                "invocation failed terminally, acking: {:#}",
                err
            );
            Ok(())
        }
        Err(err) => {
            error!(
                %component,
                message_id = %message.id,
                dequeue_count = message.dequeue_count,
                body = %message.body,
                "invocation failed: {:#}",
                err
            );
            Err(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use anyhow::anyhow;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        queue::{InMemoryQueue, QueueProducer, SendOptions},
        stream::{InMemoryStream, StreamProducer},
    };

    /// Fails the first `failures` invocations.
    struct Flaky {
        failures: StdMutex<u32>,
        seen: StdMutex<Vec<(Vec<String>, Instant)>>,
        done: tokio::sync::mpsc::UnboundedSender<()>,
    }

    impl Flaky {
        fn new(failures: u32) -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<()>) {
            let (done, rx) = tokio::sync::mpsc::unbounded_channel();
            let flaky = Arc::new(Self {
                failures: StdMutex::new(failures),
                seen: StdMutex::new(Vec::new()),
                done,
            });
            (flaky, rx)
        }

        fn attempt(&self, input: Vec<String>) -> Result<()> {
            self.seen.lock().unwrap().push((input, Instant::now()));
            let mut failures = self.failures.lock().unwrap();
            let _ = self.done.send(());
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("transient failure"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BatchHandler for Flaky {
        fn component(&self) -> Component {
            Component::GapDetector
        }

        async fn handle_batch(&self, deliveries: &[String]) -> Result<()> {
            self.attempt(deliveries.to_vec())
        }
    }

    #[async_trait]
    impl MessageHandler for Flaky {
        fn component(&self) -> Component {
            Component::BackfillProcessor
        }

        async fn handle_message(&self, body: &str) -> Result<()> {
            self.attempt(vec![body.to_string()])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_batch_is_redelivered_whole() {
        let (producer, consumer) = InMemoryStream::channel(8);
        producer.publish("a".to_string()).await.unwrap();
        producer.publish("b".to_string()).await.unwrap();
        let (handler, mut done) = Flaky::new(2);
        let runner = Arc::new(StreamRunner::new(
            handler.clone(),
            consumer,
            RunnerConfig::default(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.start(shutdown_rx).await }
        });

        for _ in 0..3 {
            done.recv().await.unwrap();
        }
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        for (batch, _) in &seen {
            assert_eq!(batch, &vec!["a".to_string(), "b".to_string()]);
        }
        assert!(seen[1].1 - seen[0].1 >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_batch_dropped_after_max_deliveries() {
        let (producer, consumer) = InMemoryStream::channel(8);
        let (handler, mut done) = Flaky::new(u32::MAX);
        let config = RunnerConfig {
            max_deliveries: 2,
            ..Default::default()
        };
        let runner = StreamRunner::new(handler.clone(), consumer, config);
        producer.publish("a".to_string()).await.unwrap();
        drop(producer);

        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        runner.start(shutdown_rx).await;
        done.recv().await.unwrap();
        assert_eq!(handler.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_redelivery_backoff() {
        let (producer, consumer) = InMemoryStream::channel(8);
        producer.publish("a".to_string()).await.unwrap();
        let (handler, mut done) = Flaky::new(u32::MAX);
        let config = RunnerConfig {
            redelivery_backoff_ms: 3_600_000,
            ..Default::default()
        };
        let runner = Arc::new(StreamRunner::new(handler.clone(), consumer, config));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let started = Instant::now();
        let task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.start(shutdown_rx).await }
        });

        done.recv().await.unwrap();
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3600));
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_queue_message_is_redelivered() {
        let (producer, consumer) =
            InMemoryQueue::channel("data-gaps", Duration::from_secs(30), 5);
        let (handler, mut done) = Flaky::new(1);
        let runner = Arc::new(QueueRunner::new(
            handler.clone(),
            consumer,
            RunnerConfig::default(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.start(shutdown_rx).await }
        });

        producer
            .send(
                "gap".to_string(),
                SendOptions {
                    ttl: Duration::from_secs(3600),
                    visibility_delay: Duration::from_secs(120),
                },
            )
            .await
            .unwrap();
        done.recv().await.unwrap();
        done.recv().await.unwrap();
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        let redelivered_after = seen[1].1 - seen[0].1;
        assert!(redelivered_after >= Duration::from_secs(30));
        assert!(redelivered_after < Duration::from_secs(31));
    }
}
