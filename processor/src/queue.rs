use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use metrics::Increment;
use opentelemetry::KeyValue;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::time::DelayQueue;
use tracing::{debug, error, warn};

/// Longest visibility or redelivery delay a queue accepts.
pub const MAX_DELAY: Duration = Duration::from_secs(crate::MAX_TIMER_SECS);

/// Dequeue attempts after which a message is dropped as poison.
pub const DEFAULT_MAX_DEQUEUE_COUNT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Time after which an undelivered message is discarded, counted from
    /// the send.
    pub ttl: Duration,
    /// Time before the message becomes visible to consumers.
    pub visibility_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
    pub dequeue_count: u32,
    pub expires_at: Instant,
}

#[async_trait]
pub trait QueueProducer: Send + Sync {
    async fn send(&self, body: String, options: SendOptions) -> Result<()>;
}

/// Named delay queue the pipeline components send to.
pub struct Queue {
    name: String,
    producer: Arc<dyn QueueProducer>,
    metrics: metrics::queue::Metrics,
}

impl Queue {
    pub fn new(name: &str, producer: Arc<dyn QueueProducer>) -> Self {
        Self {
            name: name.to_string(),
            producer,
            metrics: metrics::queue::Metrics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send_json<P: serde::Serialize + Sync>(
        &self,
        payload: &P,
        options: SendOptions,
    ) -> Result<()> {
        let labels = &[KeyValue::new("queue", self.name.clone())];
        let body = serde_json::to_string(payload)?;
        match self.producer.send(body, options).await {
            Ok(()) => {
                Increment::inc(&self.metrics.messages_sent, labels);
                Ok(())
            }
            Err(err) => {
                Increment::inc(&self.metrics.send_errors, labels);
                Err(err.context(format!("sending to queue {}", self.name)))
            }
        }
    }
}

/// Process-local delay queue. Messages become visible after their
/// visibility delay, are discarded once their time-to-live has passed, and
/// come back after `redelivery_delay` when a consumer gives them back.
pub struct InMemoryQueue;

impl InMemoryQueue {
    pub fn channel(
        name: &str,
        redelivery_delay: Duration,
        max_dequeue_count: u32,
    ) -> (InMemoryProducer, InMemoryConsumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let producer = InMemoryProducer { tx: tx.clone() };
        let consumer = InMemoryConsumer {
            name: name.to_string(),
            rx,
            pending: DelayQueue::new(),
            redelivery: Redelivery {
                name: name.to_string(),
                tx,
                delay: redelivery_delay.min(MAX_DELAY),
                max_dequeue_count,
                metrics: metrics::queue::Metrics::default(),
            },
            metrics: metrics::queue::Metrics::default(),
        };
        (producer, consumer)
    }
}

type Envelope = (QueueMessage, Duration);

#[derive(Clone)]
pub struct InMemoryProducer {
    tx: mpsc::UnboundedSender<Envelope>,
}

#[async_trait]
impl QueueProducer for InMemoryProducer {
    async fn send(&self, body: String, options: SendOptions) -> Result<()> {
        if options.visibility_delay > MAX_DELAY {
            return Err(anyhow!(
                "visibility delay {:?} exceeds the maximum of {:?}",
                options.visibility_delay,
                MAX_DELAY
            ));
        }
        let expires_at = Instant::now()
            .checked_add(options.ttl)
            .ok_or_else(|| anyhow!("time-to-live {:?} is out of range", options.ttl))?;
        let message = QueueMessage {
            id: nanoid::nanoid!(),
            body,
            dequeue_count: 0,
            expires_at,
        };
        self.tx
            .send((message, options.visibility_delay))
            .map_err(|_| anyhow!("queue consumer is gone"))
    }
}

/// Hands a message back to its queue after a failed invocation.
#[derive(Clone)]
pub struct Redelivery {
    name: String,
    tx: mpsc::UnboundedSender<Envelope>,
    delay: Duration,
    max_dequeue_count: u32,
    metrics: metrics::queue::Metrics,
}

impl Redelivery {
    pub fn nack(&self, message: QueueMessage) {
        if message.dequeue_count >= self.max_dequeue_count {
            error!(
                queue = %self.name,
                message_id = %message.id,
                body = %message.body,
                dequeue_count = message.dequeue_count,
                "dropping poison message"
            );
            return;
        }
        Increment::inc(
            &self.metrics.redeliveries,
            &[KeyValue::new("queue", self.name.clone())],
        );
        debug!(
            queue = %self.name,
            message_id = %message.id,
            "message returned for redelivery"
        );
        if self.tx.send((message, self.delay)).is_err() {
            warn!(queue = %self.name, "queue closed, message not redelivered");
        }
    }
}

pub struct InMemoryConsumer {
    name: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
    pending: DelayQueue<QueueMessage>,
    redelivery: Redelivery,
    metrics: metrics::queue::Metrics,
}

impl InMemoryConsumer {
    pub fn redelivery(&self) -> Redelivery {
        self.redelivery.clone()
    }

    /// Waits for the next visible, unexpired message.
    ///
    /// Cancel safe: messages stay queued when the future is dropped.
    pub async fn receive(&mut self) -> Option<QueueMessage> {
        loop {
            tokio::select! {
                incoming = self.rx.recv() => match incoming {
                    Some((message, delay)) => {
                        self.pending.insert(message, delay);
                    }
                    None if self.pending.is_empty() => return None,
                    None => {}
                },
                Some(expired) = self.pending.next(), if !self.pending.is_empty() => {
                    let mut message = expired.into_inner();
                    if Instant::now() >= message.expires_at {
                        Increment::inc(
                            &self.metrics.messages_expired,
                            &[KeyValue::new("queue", self.name.clone())],
                        );
                        warn!(
                            queue = %self.name,
                            message_id = %message.id,
                            body = %message.body,
                            "message expired before it was processed"
                        );
                        continue;
                    }
                    message.dequeue_count += 1;
                    return Some(message);
                }
            }
        }
    }

    pub fn nack(&self, message: QueueMessage) {
        self.redelivery.nack(message);
    }
}
