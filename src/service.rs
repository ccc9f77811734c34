use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use gap_engine::GapEngine;
use metrics::init_provider;
use processor::{
    backfill_executor::BackfillExecutor,
    backfill_processor::BackfillProcessor,
    device_rpc::{DeviceRpc, HttpDeviceRpc},
    direct_backfill::DirectBackfill,
    gap_detector::GapDetector,
    queue::{InMemoryConsumer, InMemoryQueue, Queue},
    retry_handler::RetryHandler,
    retry_policy::FixedBackoff,
    runner::{QueueRunner, StreamRunner},
    stream::{EventStream, InMemoryStream, InMemoryStreamConsumer},
    TimerConfig,
};
use tokio::{net::TcpListener, signal, sync::watch, task::JoinSet};
use tracing::{error, info, warn, Instrument};

use crate::{
    config::{ServerConfig, TransportConfig},
    routes::{create_routes, RouteState},
};

/// Queues and streams connecting the pipeline components.
#[derive(Clone)]
pub struct Transports {
    pub orphan_signals: Arc<EventStream>,
    pub gap_queue: Arc<Queue>,
    pub backfill_requests: Arc<EventStream>,
    pub gap_notices: Arc<EventStream>,
    pub retry_queue: Arc<Queue>,
}

struct Consumers {
    orphan_signals: InMemoryStreamConsumer,
    gap_queue: InMemoryConsumer,
    backfill_requests: InMemoryStreamConsumer,
    gap_notices: InMemoryStreamConsumer,
    retry_queue: InMemoryConsumer,
}

fn in_memory_transports(config: &TransportConfig) -> (Transports, Consumers) {
    let (orphan_tx, orphan_rx) = InMemoryStream::channel(config.stream_capacity);
    let (requests_tx, requests_rx) = InMemoryStream::channel(config.stream_capacity);
    let (notices_tx, notices_rx) = InMemoryStream::channel(config.stream_capacity);
    let (gaps_tx, gaps_rx) = InMemoryQueue::channel(
        "data-gaps",
        config.queue_redelivery(),
        config.max_dequeue_count,
    );
    let (retries_tx, retries_rx) = InMemoryQueue::channel(
        "backfill-retries",
        config.queue_redelivery(),
        config.max_dequeue_count,
    );

    let transports = Transports {
        orphan_signals: Arc::new(EventStream::new("orphan-signals", Arc::new(orphan_tx))),
        gap_queue: Arc::new(Queue::new("data-gaps", Arc::new(gaps_tx))),
        backfill_requests: Arc::new(EventStream::new("backfill-requests", Arc::new(requests_tx))),
        gap_notices: Arc::new(EventStream::new("gap-notices", Arc::new(notices_tx))),
        retry_queue: Arc::new(Queue::new("backfill-retries", Arc::new(retries_tx))),
    };
    let consumers = Consumers {
        orphan_signals: orphan_rx,
        gap_queue: gaps_rx,
        backfill_requests: requests_rx,
        gap_notices: notices_rx,
        retry_queue: retries_rx,
    };
    (transports, consumers)
}

/// The five pipeline components, each holding its own copy of the timers.
#[derive(Clone)]
pub struct Pipeline {
    pub gap_detector: Arc<GapDetector>,
    pub backfill_processor: Arc<BackfillProcessor>,
    pub backfill_executor: Arc<BackfillExecutor>,
    pub retry_handler: Arc<RetryHandler>,
    pub direct_backfill: Arc<DirectBackfill>,
}

impl Pipeline {
    pub fn new(
        gap_engine: Arc<GapEngine>,
        device_rpc: Arc<dyn DeviceRpc>,
        transports: &Transports,
        timers: &TimerConfig,
    ) -> Self {
        Self {
            gap_detector: Arc::new(GapDetector::new(
                gap_engine.clone(),
                transports.gap_queue.clone(),
                timers.clone(),
            )),
            backfill_processor: Arc::new(BackfillProcessor::new(
                gap_engine.clone(),
                transports.backfill_requests.clone(),
                timers.clone(),
            )),
            backfill_executor: Arc::new(BackfillExecutor::new(
                gap_engine,
                device_rpc.clone(),
                transports.gap_queue.clone(),
                timers.clone(),
            )),
            retry_handler: Arc::new(RetryHandler::new(
                device_rpc.clone(),
                FixedBackoff::new(timers.retry_delays()),
            )),
            direct_backfill: Arc::new(DirectBackfill::new(
                device_rpc,
                transports.retry_queue.clone(),
                timers.clone(),
            )),
        }
    }
}

struct Runners {
    gap_detector: Arc<StreamRunner<GapDetector>>,
    backfill_processor: Arc<QueueRunner<BackfillProcessor>>,
    backfill_executor: Arc<StreamRunner<BackfillExecutor>>,
    retry_handler: Arc<QueueRunner<RetryHandler>>,
    direct_backfill: Arc<StreamRunner<DirectBackfill>>,
}

pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub gap_engine: Arc<GapEngine>,
    pub transports: Transports,
    pub pipeline: Pipeline,
    runners: Runners,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let device_rpc = HttpDeviceRpc::new(
            config.device_rpc.clone(),
            config.timers.direct_method_response_timeout(),
        )
        .context("error initializing device rpc client")?;
        Self::with_device_rpc(config, Arc::new(device_rpc)).await
    }

    pub async fn with_device_rpc(
        config: ServerConfig,
        device_rpc: Arc<dyn DeviceRpc>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let gap_engine = Arc::new(
            GapEngine::connect(&config.store_config())
                .await
                .context("error initializing gap engine")?,
        );

        let (transports, consumers) = in_memory_transports(&config.transport);
        let pipeline = Pipeline::new(
            gap_engine.clone(),
            device_rpc,
            &transports,
            &config.timers,
        );

        let runners = Runners {
            gap_detector: Arc::new(StreamRunner::new(
                pipeline.gap_detector.clone(),
                consumers.orphan_signals,
                config.runners.clone(),
            )),
            backfill_processor: Arc::new(QueueRunner::new(
                pipeline.backfill_processor.clone(),
                consumers.gap_queue,
                config.runners.clone(),
            )),
            backfill_executor: Arc::new(StreamRunner::new(
                pipeline.backfill_executor.clone(),
                consumers.backfill_requests,
                config.runners.clone(),
            )),
            retry_handler: Arc::new(QueueRunner::new(
                pipeline.retry_handler.clone(),
                consumers.retry_queue,
                config.runners.clone(),
            )),
            direct_backfill: Arc::new(StreamRunner::new(
                pipeline.direct_backfill.clone(),
                consumers.gap_notices,
                config.runners.clone(),
            )),
        };

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            gap_engine,
            transports,
            pipeline,
            runners,
        })
    }

    pub fn route_state(&self, instance_id: String) -> RouteState {
        RouteState {
            gap_engine: self.gap_engine.clone(),
            orphan_signals: self.transports.orphan_signals.clone(),
            gap_notices: self.transports.gap_notices.clone(),
            retry_queue: self.transports.retry_queue.clone(),
            timers: self.config.timers.clone(),
            instance_id,
        }
    }

    fn start_runners(&self) -> JoinSet<()> {
        let span = tracing::Span::current();
        let mut runners = JoinSet::new();

        let runner = self.runners.gap_detector.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        runners.spawn(async move { runner.start(shutdown_rx).await }.instrument(span.clone()));

        let runner = self.runners.backfill_processor.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        runners.spawn(async move { runner.start(shutdown_rx).await }.instrument(span.clone()));

        let runner = self.runners.backfill_executor.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        runners.spawn(async move { runner.start(shutdown_rx).await }.instrument(span.clone()));

        let runner = self.runners.retry_handler.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        runners.spawn(async move { runner.start(shutdown_rx).await }.instrument(span.clone()));

        let runner = self.runners.direct_backfill.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        runners.spawn(async move { runner.start(shutdown_rx).await }.instrument(span));

        runners
    }

    /// Signals the runners and the HTTP server to wind down.
    pub fn stop(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("service already stopped");
        }
    }

    pub async fn start(&self) -> Result<()> {
        let instance_id = self.config.instance_id();
        let meter_provider = init_provider(
            self.config.telemetry.enable_metrics,
            self.config.telemetry.endpoint.as_ref(),
            self.config.telemetry.metrics_interval(),
            &instance_id,
            env!("CARGO_PKG_VERSION"),
        )?;

        let mut runners = self.start_runners();

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!("server api listening on {}", self.config.listen_addr);

        let mut shutdown_rx = self.shutdown_rx.clone();
        let served = axum::serve(listener, create_routes(self.route_state(instance_id)))
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await;

        // Stop the runners too when the server ended on its own.
        self.stop();
        while let Some(result) = runners.join_next().await {
            if let Err(err) = result {
                error!("runner task failed: {:?}", err);
            }
        }
        self.gap_engine.close().await;

        if let Some(provider) = meter_provider {
            if let Err(err) = provider.shutdown() {
                warn!("error shutting down meter provider: {:?}", err);
            }
        }
        served.map_err(Into::into)
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    if shutdown_tx.send(()).is_err() {
        warn!("service already stopped");
    }
    info!("signal received, shutting down server gracefully");
}

#[cfg(test)]
mod tests {
    use processor::test_doubles::tests::ScriptedDeviceRpc;

    use super::*;

    #[tokio::test]
    async fn test_stop_ends_every_runner() -> Result<()> {
        let config = ServerConfig {
            database_url: "sqlite::memory:".to_string(),
            ..Default::default()
        };
        let service = Service::with_device_rpc(config, ScriptedDeviceRpc::succeeding()).await?;
        let mut runners = service.start_runners();

        service.stop();
        let mut stopped = 0;
        while let Some(result) = runners.join_next().await {
            result?;
            stopped += 1;
        }
        assert_eq!(stopped, 5);

        // Stopping again is harmless.
        service.stop();
        Ok(())
    }
}
