//! Always-on counter accumulators, with optional emission through the
//! `metrics` ecosystem.

// std
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
#[cfg(feature = "metrics")] use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
#[cfg(feature = "metrics")] use smallvec::SmallVec;
// self
#[cfg(feature = "prometheus")] use crate::_prelude::*;

#[cfg(feature = "metrics")]
type LabelSet = SmallVec<[Label; 2]>;

/// Counter name for cache lookups served from a committed entry.
pub const METRIC_CACHE_HITS_TOTAL: &str = "autofeed_cache_hits_total";
/// Counter name for cache lookups that installed a fetch.
pub const METRIC_CACHE_MISSES_TOTAL: &str = "autofeed_cache_misses_total";
/// Counter name for completed upstream fetches, successful or not.
pub const METRIC_FETCHES_TOTAL: &str = "autofeed_fetches_total";
/// Counter name for failed upstream fetches.
pub const METRIC_FETCH_ERRORS_TOTAL: &str = "autofeed_fetch_errors_total";
/// Counter name for invalidated resident keys.
pub const METRIC_INVALIDATIONS_TOTAL: &str = "autofeed_invalidations_total";
/// Counter name for published topic events.
pub const METRIC_EVENTS_TOTAL: &str = "autofeed_topic_events_total";
/// Counter name for opened subscriptions.
pub const METRIC_SUBSCRIPTIONS_OPENED_TOTAL: &str = "autofeed_subscriptions_opened_total";
/// Gauge name for currently open subscriptions.
pub const METRIC_SUBSCRIPTIONS_ACTIVE: &str = "autofeed_subscriptions_active";
/// Counter name for emitted payload keys.
pub const METRIC_EMITTED_KEYS_TOTAL: &str = "autofeed_emitted_keys_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install a process-global Prometheus recorder and return its handle.
///
/// Idempotent: later calls return the handle installed first.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<PrometheusHandle> {
	if let Some(handle) = PROMETHEUS_HANDLE.get() {
		return Ok(handle.clone());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let handle = PROMETHEUS_HANDLE.get_or_init(|| handle).clone();

	Ok(handle)
}

/// Thread-safe counter accumulator for cache activity.
///
/// The accumulator is always maintained and feeds the service status
/// snapshot; under the `metrics` feature every recorded event is also emitted
/// as a `metrics` counter.
#[derive(Debug, Default)]
pub struct CacheMetrics {
	hits: AtomicU64,
	misses: AtomicU64,
	fetches: AtomicU64,
	fetch_errors: AtomicU64,
	invalidations: AtomicU64,
}
impl CacheMetrics {
	/// Record the hit/miss split of one lookup batch.
	pub(crate) fn record_lookups(&self, hits: u64, misses: u64) {
		if hits > 0 {
			self.hits.fetch_add(hits, Ordering::Relaxed);

			#[cfg(feature = "metrics")]
			metrics::counter!(METRIC_CACHE_HITS_TOTAL).increment(hits);
		}
		if misses > 0 {
			self.misses.fetch_add(misses, Ordering::Relaxed);

			#[cfg(feature = "metrics")]
			metrics::counter!(METRIC_CACHE_MISSES_TOTAL).increment(misses);
		}
	}

	/// Record an upstream fetch that committed.
	pub(crate) fn record_fetch_success(&self) {
		self.fetches.fetch_add(1, Ordering::Relaxed);

		#[cfg(feature = "metrics")]
		metrics::counter!(METRIC_FETCHES_TOTAL).increment(1);
	}

	/// Record an upstream fetch that failed.
	pub(crate) fn record_fetch_error(&self) {
		self.fetches.fetch_add(1, Ordering::Relaxed);
		self.fetch_errors.fetch_add(1, Ordering::Relaxed);

		#[cfg(feature = "metrics")]
		{
			metrics::counter!(METRIC_FETCHES_TOTAL).increment(1);
			metrics::counter!(METRIC_FETCH_ERRORS_TOTAL).increment(1);
		}
	}

	/// Record invalidations applied to resident keys.
	pub(crate) fn record_invalidations(&self, keys: u64) {
		if keys == 0 {
			return;
		}

		self.invalidations.fetch_add(keys, Ordering::Relaxed);

		#[cfg(feature = "metrics")]
		metrics::counter!(METRIC_INVALIDATIONS_TOTAL).increment(keys);
	}

	/// Capture the counters for status reporting.
	pub fn snapshot(&self) -> CacheMetricsSnapshot {
		CacheMetricsSnapshot {
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			fetches: self.fetches.load(Ordering::Relaxed),
			fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
			invalidations: self.invalidations.load(Ordering::Relaxed),
		}
	}
}

/// Point-in-time view of the cache counters.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct CacheMetricsSnapshot {
	/// Lookups served from a committed entry.
	pub hits: u64,
	/// Lookups that had to install a fetch.
	pub misses: u64,
	/// Upstream fetch operations completed, successful or not.
	pub fetches: u64,
	/// Upstream fetch operations that failed.
	pub fetch_errors: u64,
	/// Resident keys overwritten or poisoned by invalidations.
	pub invalidations: u64,
}
impl CacheMetricsSnapshot {
	/// Ratio of hits to total lookups; zero when nothing was looked up yet.
	pub fn hit_rate(&self) -> f64 {
		let total = self.hits + self.misses;

		if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
	}
}

#[cfg(feature = "metrics")]
pub(crate) fn record_publish() {
	metrics::counter!(METRIC_EVENTS_TOTAL).increment(1);
}

#[cfg(feature = "metrics")]
pub(crate) fn record_subscription_opened(mode: &'static str) {
	let labels: LabelSet = SmallVec::from_slice(&[Label::from_static_parts("mode", mode)]);

	metrics::counter!(METRIC_SUBSCRIPTIONS_OPENED_TOTAL, labels.to_vec()).increment(1);
	metrics::gauge!(METRIC_SUBSCRIPTIONS_ACTIVE).increment(1.0);
}

#[cfg(feature = "metrics")]
pub(crate) fn record_subscription_closed() {
	metrics::gauge!(METRIC_SUBSCRIPTIONS_ACTIVE).decrement(1.0);
}

#[cfg(feature = "metrics")]
pub(crate) fn record_emission(keys: u64) {
	metrics::counter!(METRIC_EMITTED_KEYS_TOTAL).increment(keys);
}
