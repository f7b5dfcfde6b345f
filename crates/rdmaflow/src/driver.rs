//! Driving contexts from a tokio runtime.
//!
//! The engine itself is synchronous. [`drive_until`] polls a set of contexts in turn,
//! yielding to the runtime between rounds and backing off while nothing happens.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::context::Context;
use crate::error::Result;

/// Pacing for [`drive_until`].
#[derive(Debug, Clone)]
pub struct DriveConfig {
    /// First sleep after an idle round (default: 50µs).
    pub idle_backoff: Duration,
    /// Cap on the idle sleep (default: 2ms).
    pub max_idle_backoff: Duration,
    /// Give up after this long (default: 10 seconds).
    pub timeout: Duration,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_micros(50),
            max_idle_backoff: Duration::from_millis(2),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Progresses every context until `done` returns true or the timeout passes.
///
/// Returns `Ok(false)` on timeout. The first progress error aborts the loop.
pub async fn drive_until(
    contexts: &mut [&mut Context],
    config: &DriveConfig,
    mut done: impl FnMut(&[&mut Context]) -> bool,
) -> Result<bool> {
    let deadline = Instant::now() + config.timeout;
    let mut backoff = config.idle_backoff;
    let mut rounds = 0u64;
    loop {
        if done(contexts) {
            trace!(rounds, "drive finished");
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        let mut handled = 0;
        for ctx in contexts.iter_mut() {
            handled += ctx.progress()?;
        }
        rounds += 1;
        if handled > 0 {
            backoff = config.idle_backoff;
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(config.max_idle_backoff);
        }
    }
}
