//! Shared linear-backoff retry helper (spec.md §9: a single generic entry
//! point that accepts an attempt-indexed function).
//!
//! Grounded on the teacher's cancellation-aware suspension points
//! (`runtimes::runner` selects on context cancellation at every await); no
//! direct retry-helper counterpart exists in the teacher, so the shape here
//! is modeled straight from spec.md §4.3/§4.4/§9 and §8's retry invariant.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{InvokeContext, ToolError};

/// A linear-backoff policy: wait = `backoff * attempt` between attempts.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// Outcome of [`invoke_with_retry`]'s observability hook, fired once per
/// non-final failure (spec.md §9).
pub struct RetryAttemptFailure<'a> {
    pub attempt: u32,
    pub error: &'a ToolError,
}

/// Runs `f` up to `policy.max_attempts` times. A non-retryable error halts
/// immediately; cancellation halts immediately; the retry wait itself is
/// cancellable (spec.md §4.3, §5, §8).
pub async fn invoke_with_retry<F, Fut, T>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut on_failure: impl FnMut(RetryAttemptFailure<'_>),
    mut f: F,
) -> Result<(T, u32), ToolError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, ToolError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(ToolError::new(super::ToolErrorCode::TransportFailure, "cancelled").retryable(false));
        }

        match f(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(err) => {
                let exhausted = attempt >= policy.max_attempts;
                if !err.retryable || exhausted {
                    return Err(err);
                }
                on_failure(RetryAttemptFailure { attempt, error: &err });

                let wait = policy.backoff * attempt;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ToolError::new(super::ToolErrorCode::TransportFailure, "cancelled during backoff").retryable(false));
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
}

/// Convenience for adapters that don't need an attempt-indexed closure
/// capture beyond [`InvokeContext`]'s cancellation token.
pub async fn invoke_with_retry_ctx<F, Fut, T>(policy: RetryPolicy, ctx: &InvokeContext, f: F) -> Result<(T, u32), ToolError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, ToolError>>,
{
    invoke_with_retry(policy, &ctx.cancel, |_| {}, f).await
}
