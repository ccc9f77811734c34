pub mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use data_model::BackfillRequest;
    use serde::de::DeserializeOwned;
    use tokio::time::Instant;

    use crate::{
        device_rpc::{DeviceRpc, MethodResponse},
        queue::{Queue, QueueProducer, SendOptions},
        stream::{EventStream, StreamProducer},
    };

    /// Device stand-in answering with queued statuses, then with
    /// `fallback_status` once the script runs out.
    pub struct ScriptedDeviceRpc {
        script: Mutex<VecDeque<u16>>,
        fallback_status: u16,
        calls: Mutex<Vec<(BackfillRequest, Instant)>>,
    }

    impl ScriptedDeviceRpc {
        pub fn new(script: &[u16], fallback_status: u16) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                fallback_status,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn succeeding() -> Arc<Self> {
            Self::new(&[], 200)
        }

        pub fn failing(status: u16) -> Arc<Self> {
            Self::new(&[], status)
        }

        pub fn calls(&self) -> Vec<(BackfillRequest, Instant)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DeviceRpc for ScriptedDeviceRpc {
        async fn invoke_backfill(&self, request: &BackfillRequest) -> MethodResponse {
            self.calls
                .lock()
                .unwrap()
                .push((request.clone(), Instant::now()));
            let status = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback_status);
            if (200..300).contains(&status) {
                MethodResponse::ok(serde_json::json!({ "accepted": true }))
            } else {
                MethodResponse::failed(status, "scripted failure")
            }
        }
    }

    /// Captures everything sent to a queue or stream; fails every send
    /// when built with [`RecordingProducer::failing`].
    #[derive(Default)]
    pub struct RecordingProducer {
        fail: bool,
        sent: Mutex<Vec<(String, Option<SendOptions>)>>,
    }

    impl RecordingProducer {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                ..Default::default()
            })
        }

        pub fn bodies(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(body, _)| body.clone())
                .collect()
        }

        pub fn options(&self) -> Vec<SendOptions> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, options)| *options)
                .collect()
        }

        pub fn decoded<T: DeserializeOwned>(&self) -> Vec<T> {
            self.bodies()
                .iter()
                .map(|body| serde_json::from_str(body).unwrap())
                .collect()
        }

        /// Removes and returns everything captured so far.
        pub fn drain(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .drain(..)
                .map(|(body, _)| body)
                .collect()
        }

        fn record(&self, body: String, options: Option<SendOptions>) -> Result<()> {
            if self.fail {
                return Err(anyhow!("injected send failure"));
            }
            self.sent.lock().unwrap().push((body, options));
            Ok(())
        }
    }

    #[async_trait]
    impl QueueProducer for RecordingProducer {
        async fn send(&self, body: String, options: SendOptions) -> Result<()> {
            self.record(body, Some(options))
        }
    }

    #[async_trait]
    impl StreamProducer for RecordingProducer {
        async fn publish(&self, body: String) -> Result<()> {
            self.record(body, None)
        }
    }

    pub fn recording_queue(name: &str) -> (Arc<Queue>, Arc<RecordingProducer>) {
        let producer = RecordingProducer::new();
        (Arc::new(Queue::new(name, producer.clone())), producer)
    }

    pub fn failing_queue(name: &str) -> Arc<Queue> {
        Arc::new(Queue::new(name, RecordingProducer::failing()))
    }

    pub fn recording_stream(name: &str) -> (Arc<EventStream>, Arc<RecordingProducer>) {
        let producer = RecordingProducer::new();
        (Arc::new(EventStream::new(name, producer.clone())), producer)
    }
}
