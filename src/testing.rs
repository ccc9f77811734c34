use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use data_model::{DataGap, OrphanSignal};
use gap_engine::{test_gap_engine::with_windows, GapEngine, StoreConfig};
use processor::{
    queue::Queue,
    raise_collected,
    runner::{BatchHandler, MessageHandler},
    stream::EventStream,
    test_doubles::tests::{RecordingProducer, ScriptedDeviceRpc},
    TimerConfig,
};
use tokio::net::TcpListener;

use crate::{
    routes::{create_routes, RouteState},
    service::{Pipeline, Transports},
};

/// Pipeline wired to recording transports. Every stage is run by hand, so
/// tests decide when a queued message becomes visible.
pub struct TestService {
    pub gap_engine: Arc<GapEngine>,
    pub device_rpc: Arc<ScriptedDeviceRpc>,
    pub pipeline: Pipeline,
    pub transports: Transports,
    pub timers: TimerConfig,
    pub orphan_signals: Arc<RecordingProducer>,
    pub gap_queue: Arc<RecordingProducer>,
    pub backfill_requests: Arc<RecordingProducer>,
    pub gap_notices: Arc<RecordingProducer>,
    pub retry_queue: Arc<RecordingProducer>,
}

impl TestService {
    pub async fn new(device_rpc: Arc<ScriptedDeviceRpc>) -> Result<Self> {
        Self::build(device_rpc, RecordingProducer::new(), TimerConfig::default()).await
    }

    pub async fn with_timers(
        device_rpc: Arc<ScriptedDeviceRpc>,
        timers: TimerConfig,
    ) -> Result<Self> {
        Self::build(device_rpc, RecordingProducer::new(), timers).await
    }

    /// Every send to the gap queue fails.
    pub async fn with_failing_gap_queue(device_rpc: Arc<ScriptedDeviceRpc>) -> Result<Self> {
        Self::build(device_rpc, RecordingProducer::failing(), TimerConfig::default()).await
    }

    async fn build(
        device_rpc: Arc<ScriptedDeviceRpc>,
        gap_queue: Arc<RecordingProducer>,
        timers: TimerConfig,
    ) -> Result<Self> {
        let gap_engine = Arc::new(GapEngine::connect(&StoreConfig::in_memory()).await?);

        let orphan_signals = RecordingProducer::new();
        let backfill_requests = RecordingProducer::new();
        let gap_notices = RecordingProducer::new();
        let retry_queue = RecordingProducer::new();
        let transports = Transports {
            orphan_signals: Arc::new(EventStream::new("orphan-signals", orphan_signals.clone())),
            gap_queue: Arc::new(Queue::new("data-gaps", gap_queue.clone())),
            backfill_requests: Arc::new(EventStream::new(
                "backfill-requests",
                backfill_requests.clone(),
            )),
            gap_notices: Arc::new(EventStream::new("gap-notices", gap_notices.clone())),
            retry_queue: Arc::new(Queue::new("backfill-retries", retry_queue.clone())),
        };
        let pipeline = Pipeline::new(
            gap_engine.clone(),
            device_rpc.clone(),
            &transports,
            &timers,
        );

        Ok(Self {
            gap_engine,
            device_rpc,
            pipeline,
            transports,
            timers,
            orphan_signals,
            gap_queue,
            backfill_requests,
            gap_notices,
            retry_queue,
        })
    }

    pub async fn record_windows(
        &self,
        windows: &[(&str, DateTime<Utc>, DateTime<Utc>)],
    ) -> Result<()> {
        with_windows(&self.gap_engine, windows).await
    }

    pub async fn signal_orphan(
        &self,
        batch_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        let signal = OrphanSignal {
            batch_id: batch_id.to_string(),
            start_window: start,
            end_window: end,
        };
        self.transports.orphan_signals.publish_json(&signal).await
    }

    /// Data gaps waiting in the gap queue, without consuming them.
    pub fn pending_gaps(&self) -> Vec<DataGap> {
        self.gap_queue.decoded()
    }

    pub async fn run_gap_detector(&self) -> Result<()> {
        run_stream(self.pipeline.gap_detector.as_ref(), &self.orphan_signals).await
    }

    pub async fn run_backfill_processor(&self) -> Result<()> {
        run_queue(self.pipeline.backfill_processor.as_ref(), &self.gap_queue).await
    }

    pub async fn run_backfill_executor(&self) -> Result<()> {
        run_stream(self.pipeline.backfill_executor.as_ref(), &self.backfill_requests).await
    }

    pub async fn run_direct_backfill(&self) -> Result<()> {
        run_stream(self.pipeline.direct_backfill.as_ref(), &self.gap_notices).await
    }

    pub async fn run_retry_handler(&self) -> Result<()> {
        run_queue(self.pipeline.retry_handler.as_ref(), &self.retry_queue).await
    }

    /// Serves the HTTP ingress on an ephemeral port and returns its base
    /// URL.
    pub async fn serve_routes(&self) -> Result<String> {
        let route_state = RouteState {
            gap_engine: self.gap_engine.clone(),
            orphan_signals: self.transports.orphan_signals.clone(),
            gap_notices: self.transports.gap_notices.clone(),
            retry_queue: self.transports.retry_queue.clone(),
            timers: self.timers.clone(),
            instance_id: "test-instance".to_string(),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, create_routes(route_state)).await;
        });
        Ok(format!("http://{addr}"))
    }
}

async fn run_stream<H: BatchHandler>(handler: &H, stream: &RecordingProducer) -> Result<()> {
    let deliveries = stream.drain();
    if deliveries.is_empty() {
        return Ok(());
    }
    handler.handle_batch(&deliveries).await
}

async fn run_queue<H: MessageHandler>(handler: &H, queue: &RecordingProducer) -> Result<()> {
    let mut errors = Vec::new();
    for body in queue.drain() {
        if let Err(err) = handler.handle_message(&body).await {
            errors.push(err);
        }
    }
    raise_collected(handler.component(), errors)
}
