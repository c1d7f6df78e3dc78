//! Backoff pacing for upstream reconnection.

// crates.io
use rand::Rng;
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Pacing configuration for upstream reconnection.
///
/// The change-stream ingest loop reconnects forever; this policy only shapes
/// how aggressively. Delays start at `initial_backoff` and double per
/// consecutive failure until `max_backoff`; each delay is smeared by `jitter`
/// so a fleet of instances does not hammer a recovering upstream in lockstep.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
	/// Delay before the first reconnection attempt after a failure.
	pub initial_backoff: Duration,
	/// Upper bound the doubling schedule saturates at.
	pub max_backoff: Duration,
	/// Fraction of each delay used as a random spread: a delay `d` is drawn
	/// uniformly from `d ± jitter * d`. Zero disables jitter.
	#[serde(default = "default_jitter")]
	pub jitter: f64,
}
impl RetryPolicy {
	/// Validate invariants for the pacing configuration.
	pub fn validate(&self) -> Result<()> {
		if self.initial_backoff.is_zero() {
			return Err(Error::Validation {
				field: "retry_policy.initial_backoff",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.max_backoff < self.initial_backoff {
			return Err(Error::Validation {
				field: "retry_policy.max_backoff",
				reason: "Must be greater than or equal to initial_backoff.".into(),
			});
		}
		if !(0.0..=1.0).contains(&self.jitter) {
			return Err(Error::Validation {
				field: "retry_policy.jitter",
				reason: "Must be within 0.0..=1.0.".into(),
			});
		}

		Ok(())
	}

	/// Spread `base` uniformly across its jitter window, capped at the
	/// configured maximum.
	fn smear(&self, base: Duration) -> Duration {
		if self.jitter == 0.0 {
			return base;
		}

		let scale = 1.0 + self.jitter * (rand::rng().random::<f64>() * 2.0 - 1.0);

		base.mul_f64(scale).min(self.max_backoff)
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			initial_backoff: Duration::from_millis(250),
			max_backoff: Duration::from_secs(10),
			jitter: default_jitter(),
		}
	}
}

/// Yields the delay to sleep before each reconnection attempt.
///
/// The schedule is plain state rather than a formula over an attempt count:
/// every failure doubles the stored delay up to the cap, every successful
/// connection resets it.
#[derive(Clone, Debug)]
pub(crate) struct RetryExecutor {
	policy: RetryPolicy,
	next_delay: Duration,
}
impl RetryExecutor {
	pub(crate) fn new(policy: RetryPolicy) -> Self {
		let next_delay = policy.initial_backoff;

		Self { policy, next_delay }
	}

	/// Forget accumulated failures after a successful connection.
	pub(crate) fn reset(&mut self) {
		self.next_delay = self.policy.initial_backoff;
	}

	/// The delay before the next attempt, advancing the schedule.
	pub(crate) fn next_backoff(&mut self) -> Duration {
		let base = self.next_delay;

		self.next_delay = base.saturating_mul(2).min(self.policy.max_backoff);

		let delay = self.policy.smear(base);

		tracing::debug!(?delay, "reconnect backoff computed");

		delay
	}
}

fn default_jitter() -> f64 {
	0.25
}
