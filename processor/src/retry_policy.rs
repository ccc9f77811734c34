use std::{future::Future, time::Duration};

use tracing::info;

use crate::device_rpc::MethodResponse;

#[derive(Debug, thiserror::Error)]
#[error("device call still failing after {attempts} attempts, last status {last_status}")]
pub struct RetryExhausted {
    pub attempts: usize,
    pub last_status: u16,
}

/// Fixed backoff schedule: one immediate attempt, then one attempt after
/// each configured delay.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delays: Vec<Duration>,
}

impl FixedBackoff {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Calls `attempt` with the 1-based attempt number until a call
    /// succeeds or the schedule runs out.
    pub async fn run<F, Fut>(&self, mut attempt: F) -> Result<MethodResponse, RetryExhausted>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = MethodResponse>,
    {
        let mut response = attempt(1).await;
        for (i, delay) in self.delays.iter().enumerate() {
            if response.is_success() {
                return Ok(response);
            }
            info!(
                attempt = i + 1,
                status = response.status,
                delay_secs = delay.as_secs(),
                "device call failed, waiting before the next attempt"
            );
            tokio::time::sleep(*delay).await;
            response = attempt(i + 2).await;
        }
        if response.is_success() {
            return Ok(response);
        }
        Err(RetryExhausted {
            attempts: self.max_attempts(),
            last_status: response.status,
        })
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::from_secs(300),
        ])
    }
}
