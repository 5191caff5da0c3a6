use std::sync::Arc;

use tracing::warn;

use crate::error::ActivityError;
use crate::runtime::registry::ActivityHandler;

/// Bounded retry policy applied by the activity dispatcher to transient
/// failures. Each attempt performs exactly one real invocation; permanent
/// failures short-circuit.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
        }
    }
}

impl RetryPolicy {
    fn backoff_ms(&self, attempt: u32) -> u64 {
        self.initial_backoff_ms.saturating_mul(1u64 << attempt.min(16))
    }

    /// Invoke the handler under this policy. Returns the final result or the
    /// terminal error string to record in history.
    pub(crate) async fn run(
        &self,
        handler: &Arc<dyn ActivityHandler>,
        instance: &str,
        name: &str,
        input: String,
    ) -> Result<String, String> {
        let mut attempt: u32 = 0;
        loop {
            match handler.invoke(input.clone()).await {
                Ok(result) => return Ok(result),
                Err(ActivityError::Permanent(e)) => return Err(e),
                Err(ActivityError::Transient(e)) => {
                    attempt += 1;
                    if attempt >= self.max_attempts.max(1) {
                        return Err(format!("transient: retries exhausted after {attempt} attempts: {e}"));
                    }
                    let backoff_ms = self.backoff_ms(attempt - 1);
                    warn!(instance, activity = %name, attempt, backoff_ms, error = %e, "transient activity failure; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                }
            }
        }
    }
}
