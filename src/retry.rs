//! Bounded retry wrapper shared by the appliers.

use std::future::Future;

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::error::FerryError;

/// Run `op` up to `max_attempts` times with no inter-attempt delay.
///
/// Typed failures that are not retryable (inline-verification mismatches) are
/// returned unchanged on the first occurrence so the supervisor can act on
/// them.
pub async fn with_retries<T, F, Fut>(max_attempts: usize, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = max_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if let Some(ferry_error) = error.downcast_ref::<FerryError>() {
                    if !ferry_error.is_retryable() {
                        return Err(error);
                    }
                }
                warn!(attempt, max_attempts = attempts, error = %format!("{error:#}"), "{op_name} failed");
                last_error = Some(error);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow!("{op_name} failed with zero attempts")))
}
