//! Bounded retry with constant back-off.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Run `operation` up to `attempts` times, sleeping `wait` between failed
/// attempts. Returns the first success, or the last error once the attempt
/// budget is exhausted. `name` is only used for logging.
pub async fn retry_with_constant_wait<T, E, F, Fut>(
    name: &str,
    attempts: usize,
    wait: Duration,
    mut operation: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!(
                    "[{}] Attempt {}/{} failed: {}. Retrying in {:?}...",
                    name, attempt, attempts, err, wait
                );
                attempt += 1;
                tokio::time::sleep(wait).await;
            }
            Err(err) => {
                warn!("[{}] All {} attempts failed: {}", name, attempts, err);
                return Err(err);
            }
        }
    }
}
