use std::future::Future;
use std::time::Duration;
use log::{debug, warn};

/// Backoff policy: `base * 2^attempt` for attempt 0, 1, 2, ...
pub fn exponential(base: Duration) -> impl Fn(u32) -> Duration {
    move |attempt| base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Run `op` once, then retry it up to `max_retries` more times, sleeping
/// `backoff(n)` after the n-th failure. Returns the first success or the last error.
pub async fn attempt<T, E, F, Fut, B>(max_retries: u32, backoff: B, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    B: Fn(u32) -> Duration,
    E: std::fmt::Display,
{
    let attempts = max_retries.saturating_add(1);
    let mut n = 0;
    loop {
        match op(n).await {
            Ok(value) => {
                if n > 0 {
                    debug!("Succeeded after {} retr{}", n, if n == 1 { "y" } else { "ies" });
                }
                return Ok(value);
            }
            Err(e) if n + 1 < attempts => {
                let delay = backoff(n);
                warn!("Attempt {}/{} failed: {} (retrying in {:?})", n + 1, attempts, e, delay);
                tokio::time::sleep(delay).await;
                n += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Worst-case total sleep for a retry loop
pub fn total_backoff<B: Fn(u32) -> Duration>(max_retries: u32, backoff: B) -> Duration {
    (0..max_retries).map(backoff).sum()
}
