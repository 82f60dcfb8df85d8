//! Retry policies for the coordination protocols.
//!
//! # Available Policies
//!
//! | Policy | Delay | Attempts | Use Case |
//! |--------|-------|----------|----------|
//! | [`ElectionBackoff`] | random in `[1, 2^n)` units | `lock_max_attempts` | Contended resource elections |
//! | [`convergecast_policy`] | 100ms to 2s, jittered | 3 retries | Takeover convergecast after a participant left |
//!
//! Election backoff is randomized per attempt so two brokers that tied on a
//! creation timestamp stop colliding with high probability.
//!
//! # Example
//!
//! ```rust,no_run
//! use raptor_cluster::cluster::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let result = (|| async {
//!         // your fallible operation
//!         Ok::<_, std::io::Error>(())
//!     })
//!     .retry(retry::convergecast_policy())
//!     .when(|e| e.kind() == std::io::ErrorKind::ConnectionReset)
//!     .await?;
//!
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use backon::ExponentialBuilder;

/// Binary exponential random backoff between election attempts.
///
/// Yields at most `max_attempts - 1` delays: the delay before attempt `n+1`
/// is `random(0..2^n)` units, raised to one unit when the draw is zero.
#[derive(Debug, Clone)]
pub struct ElectionBackoff {
    unit: Duration,
    window: u64,
    remaining: u32,
}

/// Largest window exponent; keeps `window` clear of overflow for huge
/// attempt ceilings.
const MAX_WINDOW_SHIFT: u32 = 16;

impl ElectionBackoff {
    pub fn new(unit: Duration, max_attempts: u32) -> Self {
        Self {
            unit,
            window: 1,
            remaining: max_attempts.saturating_sub(1),
        }
    }
}

impl Iterator for ElectionBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        if self.window < (1 << MAX_WINDOW_SHIFT) {
            self.window *= 2;
        }
        let units = fastrand::u64(0..self.window).max(1);
        Some(self.unit.saturating_mul(units as u32))
    }
}

/// Policy for restarting a takeover convergecast after a participant left.
///
/// Characteristics:
/// - Short initial delay (100ms) so the membership change can settle
/// - Short max delay (2s)
/// - Few retries (3): a cluster that keeps losing brokers fails the takeover
/// - Includes jitter
pub fn convergecast_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
}
