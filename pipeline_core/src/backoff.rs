use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

pub fn create_backoff(max_retries: u32, base_delay_ms: u64) -> ExponentialBackoff<backoff::SystemClock> {
    ExponentialBackoff {
        current_interval: Duration::from_millis(base_delay_ms),
        initial_interval: Duration::from_millis(base_delay_ms),
        randomization_factor: 0.5, // Add jitter
        multiplier: 2.0,
        max_interval: Duration::from_secs(60),
        max_elapsed_time: Some(Duration::from_secs(max_retries as u64 * 60)),
        ..ExponentialBackoff::default()
    }
}

/// Retries an operation with exponential backoff, stopping immediately on a
/// non-retryable `pipeline_core::Error` (auth failures, quota exhaustion,
/// backend query failures) instead of burning retries on something a retry
/// can't fix.
pub async fn retry_if_retryable<F, Fut, T>(
    operation: F,
    max_retries: u32,
    base_delay_ms: u64,
    operation_name: &str,
) -> Result<T, crate::error::Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, crate::error::Error>>,
{
    let mut backoff = create_backoff(max_retries, base_delay_ms);
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempts >= max_retries {
                    warn!(operation = operation_name, attempts, error = %e, "operation failed after max retries");
                    return Err(e);
                }

                if let Some(duration) = backoff.next_backoff() {
                    warn!(
                        operation = operation_name,
                        attempt = attempts,
                        retry_after_ms = duration.as_millis(),
                        error = %e,
                        "transient operation failed, retrying"
                    );
                    tokio::time::sleep(duration).await;
                } else {
                    return Err(e);
                }
            }
        }
    }
}

/// Randomised 2-4s (configurable) jittered delay used by the analytics poll
/// loop to spread load across concurrent refreshers hitting the same
/// backend.
pub async fn jittered_poll_delay(min_secs: u64, max_secs: u64) {
    let min_secs = min_secs.min(max_secs);
    let millis = if max_secs > min_secs {
        rand::thread_rng().gen_range(min_secs * 1000..=max_secs * 1000)
    } else {
        min_secs * 1000
    };
    tokio::time::sleep(Duration::from_millis(millis)).await;
}