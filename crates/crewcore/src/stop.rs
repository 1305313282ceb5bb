use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Granularity of `StopFlag::sleep` polling.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Returned by work that noticed its stop flag and gave up early.
///
/// The runtime recognises this error (through `anyhow::Error::is`) and settles
/// the execution as cancelled rather than failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("stop requested")]
pub struct Cancelled;

/// Per-execution stop signal handed to every unit of work.
///
/// Raising the flag never interrupts a thread. Work must poll it at safe
/// points (`is_raised`, `check`, or `sleep`) and return `Err(Cancelled)` to
/// honour it.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    token: CancellationToken,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Idempotent.
    pub fn raise(&self) {
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Cancelled)` once the flag is raised, for use with `?`.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_raised() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Block the current thread for `duration`, waking early if the flag is raised.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}
