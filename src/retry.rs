// src/retry.rs
//
// Waiting for an external service to become ready: exponential backoff with
// a total timeout and a shared cancellation flag (set from the Ctrl-C
// handler in main).

use crate::error::PolicyError;
use crate::types::RetryConfig;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a single readiness attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Poll<T> {
    NotReady,
    Ready(T),
}

/// Value returned once the service was ready, with the number of backoff
/// sleeps it took to get there.
#[derive(Debug, Clone, PartialEq)]
pub struct Polled<T> {
    pub value: T,
    pub retries: u32,
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        let next = current.mul_f64(self.multiplier.max(1.0));
        next.min(Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)))
    }
}

/// Call `attempt` until it reports ready.
///
/// Not-ready replies and transport errors are both retried. Gives up with
/// `PolicyError::Timeout` when the next sleep would overrun the configured
/// timeout, and with `PolicyError::Cancelled` as soon as `cancel` is set.
pub async fn poll_until_ready<T, F, Fut>(
    cfg: &RetryConfig,
    cancel: &CancelFlag,
    mut attempt: F,
) -> Result<Polled<T>, PolicyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, PolicyError>>,
{
    let started = Instant::now();
    let timeout = cfg.timeout();
    let mut backoff = cfg.initial_backoff();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PolicyError::Cancelled { attempts });
        }

        attempts += 1;
        match attempt().await {
            Ok(Poll::Ready(value)) => {
                return Ok(Polled {
                    value,
                    retries: attempts - 1,
                })
            }
            Ok(Poll::NotReady) => debug!("Service not ready (attempt {})", attempts),
            Err(e) => warn!("Attempt {} failed, retrying: {}", attempts, e),
        }

        let waited = started.elapsed();
        if waited + backoff > timeout {
            return Err(PolicyError::Timeout { attempts, waited });
        }
        tokio::time::sleep(backoff).await;
        backoff = cfg.next_backoff(backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn cfg() -> RetryConfig {
        RetryConfig {
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 2000,
            timeout_secs: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_first_time_needs_no_sleep() {
        let out = poll_until_ready(&cfg(), &CancelFlag::new(), || async {
            Ok(Poll::Ready("traj"))
        })
        .await
        .unwrap();
        assert_eq!(out, Polled { value: "traj", retries: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_once_sleeps_once() {
        let calls = Cell::new(0);
        let start = Instant::now();
        let out = poll_until_ready(&cfg(), &CancelFlag::new(), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n == 1 {
                    Ok(Poll::NotReady)
                } else {
                    Ok(Poll::Ready(n))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out.retries, 1);
        assert_eq!(out.value, 2);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_then_times_out() {
        let start = Instant::now();
        let err = poll_until_ready::<(), _, _>(&cfg(), &CancelFlag::new(), || async {
            Ok(Poll::NotReady)
        })
        .await
        .unwrap_err();
        // sleeps: 0.5 + 1 + 2 + 2 + 2 + 2 = 9.5s; the next 2s sleep would pass 10s
        match err {
            PolicyError::Timeout { attempts, waited } => {
                assert_eq!(attempts, 7);
                assert!(waited >= Duration::from_millis(9500) && waited < Duration::from_millis(9600));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_waiting() {
        let cancel = CancelFlag::new();
        let calls = Cell::new(0u32);
        let err = poll_until_ready::<(), _, _>(&cfg(), &cancel, || {
            calls.set(calls.get() + 1);
            if calls.get() == 2 {
                cancel.cancel();
            }
            async { Ok(Poll::NotReady) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PolicyError::Cancelled { attempts: 2 }));
    }
}
