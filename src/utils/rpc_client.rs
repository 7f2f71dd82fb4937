use std::time::Duration;
use std::{fmt, future::Future};
use tokio::time::sleep;
use tracing::warn;

use super::retry_policy::ExponentialBackoff;

/// Execute an async operation with exponential backoff retry logic
pub(crate) async fn execute_with_retries<F, Fut, T, E>(
    operation: F,
    operation_name: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let retry_policy = ExponentialBackoff::new(3, 10, 1.5);
    let mut last_error = None;

    for attempt in 0..=retry_policy.max_retries() {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < retry_policy.max_retries() {
                    let delay = retry_policy.get_delay(attempt + 1);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_retries = retry_policy.max_retries(),
                        delay_secs = delay,
                        error = %e,
                        "Operation failed, retrying..."
                    );
                    sleep(Duration::from_secs(delay)).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.expect("last_error should be set after all retries"))
}
