//! Crash isolation for long-lived background tasks.
//!
//! Every long-lived loop in the manager (output drains, heartbeat listeners,
//! the sweep) runs behind [`run_isolated`]: a panic inside one run is caught
//! at the task boundary, logged, and only that loop is relaunched after a
//! short backoff. Nothing else in the process is torn down.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use rand::Rng;
use tokio::sync::watch;
use tracing::{error, warn};

/// Exponential backoff between relaunches.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(16) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Run the future produced by `make` until it completes normally,
/// relaunching it each time it panics.
pub async fn run_isolated<F, Fut>(task: &'static str, backoff: &BackoffPolicy, mut make: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut restarts = 0u32;

    loop {
        match AssertUnwindSafe(make()).catch_unwind().await {
            Ok(()) => return,
            Err(payload) => {
                let delay = backoff.delay(restarts);
                restarts = restarts.saturating_add(1);
                if restarts > 3 {
                    error!(
                        task,
                        restarts,
                        panic = %panic_message(payload.as_ref()),
                        "Task keeps panicking, relaunching"
                    );
                } else {
                    warn!(
                        task,
                        restarts,
                        panic = %panic_message(payload.as_ref()),
                        delay_ms = delay.as_millis() as u64,
                        "Task panicked, relaunching"
                    );
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Wait until a close signal is raised. A dropped sender counts as closed.
pub async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
