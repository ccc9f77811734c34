use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use data_model::{BackfillRequest, DataGap};
use gap_engine::GapEngine;
use metrics::pipeline;
use tracing::{info, instrument};

use crate::{runner::MessageHandler, stream::EventStream, Component, TimerConfig};

/// Turns due data gaps into backfill requests, unless an active request
/// already covers them.
pub struct BackfillProcessor {
    gap_engine: Arc<GapEngine>,
    execution_stream: Arc<EventStream>,
    timers: TimerConfig,
    metrics: pipeline::Metrics,
}

impl BackfillProcessor {
    pub fn new(
        gap_engine: Arc<GapEngine>,
        execution_stream: Arc<EventStream>,
        timers: TimerConfig,
    ) -> Self {
        Self {
            gap_engine,
            execution_stream,
            timers,
            metrics: pipeline::Metrics::default(),
        }
    }

    /// Publishes one request per gap still open inside the gap's window.
    /// Returns the published requests; none when the window is leased or
    /// late data has closed it.
    #[instrument(skip_all, fields(batch_id = %gap.batch_id))]
    pub async fn process(&self, gap: &DataGap) -> Result<Vec<BackfillRequest>> {
        if self.is_leased(gap).await? {
            return Ok(vec![]);
        }

        let residual = self
            .gap_engine
            .compute_gaps_in_window(&gap.batch_id, gap.start_window, gap.end_window)
            .await?;
        if residual.is_empty() {
            info!(
                component = %Component::BackfillProcessor,
                %gap,
                "data gap already closed"
            );
        }

        let mut requests = Vec::with_capacity(residual.len());
        for sub_gap in residual {
            // Another processor may have leased part of the window since the
            // first check.
            if self.is_leased(&sub_gap).await? {
                continue;
            }
            let request = BackfillRequest::for_gap(&sub_gap, Utc::now());
            self.execution_stream.publish_json(&request).await?;
            self.metrics.requests_dispatched.add(1, &[]);
            info!(
                component = %Component::BackfillProcessor,
                %request,
                "published backfill request"
            );
            requests.push(request);
        }
        Ok(requests)
    }

    async fn is_leased(&self, gap: &DataGap) -> Result<bool> {
        let active = self
            .gap_engine
            .find_active_request(gap, self.timers.backfill_timeout())
            .await?;
        match active {
            Some(request) => {
                self.metrics.dedup_hits.add(1, &[]);
                info!(
                    component = %Component::BackfillProcessor,
                    %gap,
                    existing = %request,
                    "found active backfill request, skipping"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl MessageHandler for BackfillProcessor {
    fn component(&self) -> Component {
        Component::BackfillProcessor
    }

    async fn handle_message(&self, body: &str) -> Result<()> {
        let gap: DataGap =
            serde_json::from_str(body).with_context(|| format!("invalid data gap: {body}"))?;
        info!(component = %Component::BackfillProcessor, %gap, "processing data gap");
        self.process(&gap)
            .await
            .with_context(|| format!("processing data gap {gap}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeDelta};
    use data_model::test_objects::tests::{minutes_after, mock_request, TEST_BATCH};
    use gap_engine::test_gap_engine::{engine_with_windows, recent_base};

    use super::*;
    use crate::test_doubles::tests::*;

    async fn engine(base: DateTime<Utc>) -> Arc<GapEngine> {
        let engine = engine_with_windows(&[
            (TEST_BATCH, base, minutes_after(base, 1)),
            (TEST_BATCH, minutes_after(base, 3), minutes_after(base, 4)),
        ])
        .await
        .unwrap();
        Arc::new(engine)
    }

    #[tokio::test]
    async fn test_gap_becomes_request() {
        let base = recent_base();
        let engine = engine(base).await;
        let (stream, published) = recording_stream("backfill-requests");
        let processor = BackfillProcessor::new(engine, stream, TimerConfig::default());

        let gap = DataGap::between(TEST_BATCH, minutes_after(base, 1), minutes_after(base, 3));
        processor.handle_message(&gap.to_string()).await.unwrap();

        let requests: Vec<BackfillRequest> = published.decoded();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].start_window, gap.start_window);
        assert_eq!(requests[0].end_window, gap.end_window);
        assert!(Utc::now() - requests[0].created < TimeDelta::minutes(1));
    }

    #[tokio::test]
    async fn test_active_request_suppresses_dispatch() {
        let base = recent_base();
        let engine = engine(base).await;
        let (stream, published) = recording_stream("backfill-requests");
        let processor = BackfillProcessor::new(engine.clone(), stream, TimerConfig::default());

        let gap = DataGap::between(TEST_BATCH, minutes_after(base, 1), minutes_after(base, 3));
        engine
            .record_active_request(&BackfillRequest::for_gap(&gap, Utc::now()))
            .await
            .unwrap();

        assert!(processor.process(&gap).await.unwrap().is_empty());
        assert!(published.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_allows_dispatch() {
        let base = recent_base();
        let engine = engine(base).await;
        let (stream, published) = recording_stream("backfill-requests");
        let processor = BackfillProcessor::new(engine.clone(), stream, TimerConfig::default());

        let stale = Utc::now() - TimeDelta::hours(2);
        let gap = DataGap::between(TEST_BATCH, minutes_after(base, 1), minutes_after(base, 3));
        engine
            .record_active_request(&mock_request(
                TEST_BATCH,
                gap.start_window,
                gap.end_window,
                stale,
            ))
            .await
            .unwrap();

        assert_eq!(processor.process(&gap).await.unwrap().len(), 1);
        assert_eq!(published.bodies().len(), 1);
    }

    #[tokio::test]
    async fn test_late_data_splits_and_closes_gaps() {
        let base = recent_base();
        let engine = engine(base).await;
        let (stream, published) = recording_stream("backfill-requests");
        let processor = BackfillProcessor::new(engine.clone(), stream, TimerConfig::default());
        let gap = DataGap::between(TEST_BATCH, minutes_after(base, 1), minutes_after(base, 3));

        // A late window in the middle leaves two smaller gaps.
        engine
            .record_window(&data_model::WindowRecord::new(
                TEST_BATCH,
                minutes_after(base, 2),
                minutes_after(base, 2) + TimeDelta::seconds(30),
            ))
            .await
            .unwrap();
        let requests = processor.process(&gap).await.unwrap();
        let windows: Vec<_> = requests
            .iter()
            .map(|r| (r.start_window, r.end_window))
            .collect();
        assert_eq!(
            windows,
            vec![
                (
                    minutes_after(base, 2) + TimeDelta::seconds(30),
                    minutes_after(base, 3)
                ),
                (minutes_after(base, 1), minutes_after(base, 2)),
            ]
        );
        assert_eq!(published.drain().len(), 2);

        // Filling both leaves nothing to request.
        for (start, end) in windows {
            engine
                .record_window(&data_model::WindowRecord::new(TEST_BATCH, start, end))
                .await
                .unwrap();
        }
        assert!(processor.process(&gap).await.unwrap().is_empty());
        assert!(published.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_lease_elsewhere_in_batch_does_not_block() {
        let base = recent_base();
        let engine = engine(base).await;
        engine
            .record_window(&data_model::WindowRecord::new(
                TEST_BATCH,
                minutes_after(base, 2),
                minutes_after(base, 2) + TimeDelta::seconds(30),
            ))
            .await
            .unwrap();
        let late_start = minutes_after(base, 2) + TimeDelta::seconds(30);
        engine
            .record_active_request(&mock_request(
                TEST_BATCH,
                late_start,
                minutes_after(base, 3),
                Utc::now(),
            ))
            .await
            .unwrap();

        let (stream, published) = recording_stream("backfill-requests");
        let processor = BackfillProcessor::new(engine, stream, TimerConfig::default());
        let uncovered = DataGap::between(TEST_BATCH, minutes_after(base, 1), minutes_after(base, 2));
        let requests = processor.process(&uncovered).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(published.bodies().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_fails_invocation() {
        let base = recent_base();
        let engine = engine(base).await;
        let stream = Arc::new(EventStream::new(
            "backfill-requests",
            RecordingProducer::failing(),
        ));
        let processor = BackfillProcessor::new(engine, stream, TimerConfig::default());

        let gap = DataGap::between(TEST_BATCH, minutes_after(base, 1), minutes_after(base, 3));
        let err = processor.handle_message(&gap.to_string()).await.unwrap_err();
        assert!(format!("{err:#}").contains("injected send failure"));
        assert!(processor.handle_message("{").await.is_err());
    }
}
