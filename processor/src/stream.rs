use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use metrics::Increment;
use opentelemetry::KeyValue;
use tokio::sync::mpsc;

#[async_trait]
pub trait StreamProducer: Send + Sync {
    async fn publish(&self, body: String) -> Result<()>;
}

/// Named event stream. Consumers receive its events in batches of delivery
/// units, each unit holding one or more newline-delimited JSON messages.
pub struct EventStream {
    name: String,
    producer: Arc<dyn StreamProducer>,
    metrics: metrics::queue::Metrics,
}

impl EventStream {
    pub fn new(name: &str, producer: Arc<dyn StreamProducer>) -> Self {
        Self {
            name: name.to_string(),
            producer,
            metrics: metrics::queue::Metrics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn publish_json<P: serde::Serialize + Sync>(&self, payload: &P) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        self.publish(body).await
    }

    pub async fn publish(&self, body: String) -> Result<()> {
        let labels = &[KeyValue::new("stream", self.name.clone())];
        match self.producer.publish(body).await {
            Ok(()) => {
                Increment::inc(&self.metrics.messages_sent, labels);
                Ok(())
            }
            Err(err) => {
                Increment::inc(&self.metrics.send_errors, labels);
                Err(err.context(format!("publishing to stream {}", self.name)))
            }
        }
    }
}

pub struct InMemoryStream;

impl InMemoryStream {
    pub fn channel(capacity: usize) -> (InMemoryStreamProducer, InMemoryStreamConsumer) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            InMemoryStreamProducer { tx },
            InMemoryStreamConsumer { rx },
        )
    }
}

#[derive(Clone)]
pub struct InMemoryStreamProducer {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl StreamProducer for InMemoryStreamProducer {
    async fn publish(&self, body: String) -> Result<()> {
        self.tx
            .send(body)
            .await
            .map_err(|_| anyhow!("stream consumer is gone"))
    }
}

pub struct InMemoryStreamConsumer {
    rx: mpsc::Receiver<String>,
}

impl InMemoryStreamConsumer {
    /// Waits for at least one delivery unit and returns up to `max` of
    /// them. `None` once every producer is gone and the stream is drained.
    pub async fn receive_batch(&mut self, max: usize) -> Option<Vec<String>> {
        let mut batch = Vec::with_capacity(max);
        match self.rx.recv_many(&mut batch, max.max(1)).await {
            0 => None,
            _ => Some(batch),
        }
    }
}
