//! Bounded, cancellable polling.
//!
//! Every blocking wait in the runner (guest boot, server preload, detached guest jobs) is a
//! predicate polled at a fixed interval. Each call site gets its own `PollPolicy`, so a deadline
//! can be set per wait. A `None` deadline polls forever.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use log::debug;

use serde::{Deserialize, Serialize};

use crate::error::TimeoutError;

/// How often to poll, and for how long.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Time between two evaluations of the predicate.
    pub interval: Duration,
    /// Give up after this long. `None` means never give up.
    pub deadline: Option<Duration>,
}

impl PollPolicy {
    pub fn new(interval: Duration, deadline: Option<Duration>) -> Self {
        PollPolicy { interval, deadline }
    }

    /// Poll every `interval_secs` seconds with no deadline.
    pub fn unbounded(interval_secs: u64) -> Self {
        PollPolicy {
            interval: Duration::from_secs(interval_secs),
            deadline: None,
        }
    }
}

/// A cheap, cloneable cancellation flag. Tripped by the `^C` handler in `main`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Evaluate `pred` until it returns `Ok(true)`.
///
/// Fails with `TimeoutError` when the policy's deadline passes or `cancel` is tripped. Errors
/// returned by `pred` itself abort the wait immediately.
pub fn poll_until<F>(
    policy: &PollPolicy,
    cancel: &CancelToken,
    what: &str,
    mut pred: F,
) -> Result<(), failure::Error>
where
    F: FnMut() -> Result<bool, failure::Error>,
{
    let start = Instant::now();
    let mut attempts = 0usize;

    loop {
        if cancel.is_cancelled() {
            return Err(TimeoutError::Cancelled { what: what.into() }.into());
        }

        attempts += 1;
        if pred()? {
            debug!("{} after {} attempt(s), {:?}", what, attempts, start.elapsed());
            return Ok(());
        }

        if let Some(deadline) = policy.deadline {
            if start.elapsed() + policy.interval > deadline {
                return Err(TimeoutError::Deadline {
                    what: what.into(),
                    waited: start.elapsed(),
                }
                .into());
            }
        }

        debug!("still waiting for {} (attempt {})", what, attempts);
        std::thread::sleep(policy.interval);
    }
}
