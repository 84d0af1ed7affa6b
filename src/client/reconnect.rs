use std::future::Future;
use std::time::Duration;

use bon::Builder;
use tracing::warn;

use crate::error::RpcError;

/// Bounded retry for establishing a connection.
#[derive(Debug, Clone, Builder)]
pub struct ReconnectPolicy {
    /// Total connection attempts, including the first. Zero is treated as one.
    #[builder(default = 1)]
    pub max_attempts: u32,

    /// Pause between attempts.
    #[builder(default = Duration::from_secs(1))]
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconnectPolicy {
    /// Run `attempt` until it succeeds or the attempts are used up.
    pub async fn run<T, F, Fut>(&self, endpoint: &str, mut attempt: F) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut tries = 0;

        loop {
            tries += 1;
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if tries < max_attempts => {
                    warn!(
                        endpoint = %endpoint,
                        attempt = tries,
                        max_attempts,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
