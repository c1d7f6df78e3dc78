//! Service wiring: configuration, ingest lifecycle, and status reporting.

// std
use std::sync::atomic::{AtomicI64, Ordering};
// crates.io
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
// self
use crate::{
	_prelude::*,
	datastore::{Datastore, Source},
	metrics::CacheMetricsSnapshot,
	request::Selector,
	restrict::{AllowAll, Restricter},
	retry::RetryPolicy,
	subscription::Subscription,
	topic::{self, Topic},
};

/// Builder for [`Autoupdate`].
pub struct AutoupdateBuilder {
	source: Arc<dyn Source>,
	restricter: Arc<dyn Restricter>,
	topic_capacity: usize,
	retry_policy: RetryPolicy,
}
impl AutoupdateBuilder {
	/// Start building a service over the given upstream.
	pub fn new(source: Arc<dyn Source>) -> Self {
		Self {
			source,
			restricter: Arc::new(AllowAll),
			topic_capacity: topic::DEFAULT_CAPACITY,
			retry_policy: RetryPolicy::default(),
		}
	}

	/// Install the per-user restriction policy (defaults to [`AllowAll`]).
	pub fn restricter(mut self, restricter: Arc<dyn Restricter>) -> Self {
		self.restricter = restricter;

		self
	}

	/// Number of invalidation events retained for slow subscribers.
	pub fn topic_capacity(mut self, capacity: usize) -> Self {
		self.topic_capacity = capacity;

		self
	}

	/// Pacing for upstream reconnection attempts.
	pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
		self.retry_policy = policy;

		self
	}

	/// Validate the configuration, spawn the ingest task, and hand out the
	/// service.
	///
	/// Must be called within a Tokio runtime.
	pub fn build(self) -> Result<Autoupdate> {
		self.retry_policy.validate()?;

		let datastore = Datastore::new(self.source, Topic::with_capacity(self.topic_capacity));
		let (shutdown, shutdown_rx) = watch::channel(false);
		let ingest = tokio::spawn(datastore.clone().ingest(self.retry_policy, shutdown_rx));

		Ok(Autoupdate {
			datastore,
			restricter: self.restricter,
			shutdown,
			ingest,
			connections: Arc::new(AtomicI64::new(0)),
			started_at: Utc::now(),
		})
	}
}

/// The autoupdate service: one cache, one topic, one upstream ingest task,
/// and any number of subscriptions.
pub struct Autoupdate {
	datastore: Datastore,
	restricter: Arc<dyn Restricter>,
	shutdown: watch::Sender<bool>,
	ingest: JoinHandle<()>,
	connections: Arc<AtomicI64>,
	started_at: DateTime<Utc>,
}
impl Autoupdate {
	/// Start building a service over the given upstream.
	pub fn builder(source: Arc<dyn Source>) -> AutoupdateBuilder {
		AutoupdateBuilder::new(source)
	}

	/// The facade shared by every subscription.
	pub fn datastore(&self) -> &Datastore {
		&self.datastore
	}

	/// Open a subscription for the given user and selector.
	pub fn subscribe(&self, uid: u64, selector: Selector) -> Subscription {
		self.connections.fetch_add(1, Ordering::Relaxed);

		#[cfg(feature = "metrics")]
		crate::metrics::record_subscription_opened(match &selector {
			Selector::Keys(_) => "keys",
			Selector::Requests(_) => "requests",
		});

		tracing::debug!(uid, "subscription opened");

		Subscription::new(
			self.datastore.clone(),
			self.restricter.clone(),
			uid,
			selector,
			self.shutdown.subscribe(),
			ConnectionGuard { connections: self.connections.clone() },
		)
	}

	/// Capture a point-in-time status snapshot.
	pub async fn status(&self) -> ServiceStatus {
		let topic = self.datastore.topic().snapshot().await;

		ServiceStatus {
			started_at: self.started_at,
			subscriptions: self.connections.load(Ordering::Relaxed),
			resident_keys: self.datastore.cache().len().await,
			published_events: topic.published_events(),
			retained_events: topic.retained_events,
			last_change_at: topic.last_published_at,
			cache: self.datastore.cache().metrics().snapshot(),
		}
	}

	/// Stop the ingest task and cancel every blocked subscription promptly.
	pub fn shutdown(&self) {
		let _ = self.shutdown.send(true);

		self.ingest.abort();
	}
}
impl Drop for Autoupdate {
	fn drop(&mut self) {
		self.shutdown();
	}
}

/// Point-in-time service health snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceStatus {
	/// Wall-clock time the service was built.
	pub started_at: DateTime<Utc>,
	/// Currently open subscriptions.
	pub subscriptions: i64,
	/// Keys resident in the cache, committed or in flight.
	pub resident_keys: usize,
	/// Invalidation events ever published.
	pub published_events: u64,
	/// Invalidation events still retained for slow subscribers.
	pub retained_events: usize,
	/// Wall-clock time of the most recent upstream change.
	pub last_change_at: Option<DateTime<Utc>>,
	/// Cache counters accumulated since start.
	pub cache: CacheMetricsSnapshot,
}

/// Decrements the connection gauge when a subscription is dropped.
pub(crate) struct ConnectionGuard {
	connections: Arc<AtomicI64>,
}
impl Drop for ConnectionGuard {
	fn drop(&mut self) {
		self.connections.fetch_sub(1, Ordering::Relaxed);

		#[cfg(feature = "metrics")]
		crate::metrics::record_subscription_closed();
	}
}
