//! Coalesced read-through facade over the upstream datastore.

// std
use std::{collections::HashMap, fmt};
// crates.io
use async_trait::async_trait;
use futures_util::{StreamExt, stream::BoxStream};
use tokio::sync::watch;
// self
use crate::{
	_prelude::*,
	cache::{manager::KeyCache, state::Value},
	key::Key,
	retry::{RetryExecutor, RetryPolicy},
	topic::Topic,
};

/// One batch of upstream changes: key to new value, where the absent marker
/// records a deletion.
pub type ChangeBatch = HashMap<Key, Value>;

/// Stream of change batches produced by an upstream connection.
pub type ChangeStream = BoxStream<'static, Result<ChangeBatch>>;

/// Upstream datastore transport.
///
/// The facade only depends on this interface: point reads for cache misses
/// and a change feed for invalidation. Reconnection after a broken feed is the
/// facade's job; implementations hand out one connected stream per call.
#[async_trait]
pub trait Source: Send + Sync {
	/// Read the current values for `keys`; keys missing from the returned map
	/// do not exist upstream.
	async fn read(&self, keys: &[Key]) -> Result<HashMap<Key, Bytes>>;

	/// Open a connection to the upstream change feed.
	async fn changes(&self) -> Result<ChangeStream>;
}

/// Read-through cache facade coupling the key cache to the change topic.
///
/// `get` serves from the cache and coalesces upstream reads; the ingest task
/// applies every change batch to the cache *before* publishing it, so a
/// subscriber woken by the topic always observes cache state at least as new
/// as the event that woke it.
#[derive(Clone)]
pub struct Datastore {
	cache: KeyCache,
	topic: Topic,
	source: Arc<dyn Source>,
}
impl Datastore {
	/// Build a facade over the given upstream with its own cache and topic.
	pub fn new(source: Arc<dyn Source>, topic: Topic) -> Self {
		Self { cache: KeyCache::new(), topic, source }
	}

	/// The invalidation topic driven by this facade.
	pub fn topic(&self) -> &Topic {
		&self.topic
	}

	/// The underlying key cache.
	pub fn cache(&self) -> &KeyCache {
		&self.cache
	}

	/// Current values for `keys`, in order, reading through to the upstream
	/// for whatever is not resident.
	#[tracing::instrument(skip_all, fields(keys = keys.len()))]
	pub async fn get(&self, keys: &[Key]) -> Result<Vec<Value>> {
		let source = self.source.clone();

		self.cache
			.get_or_set(keys, move |missing| {
				let source = source.clone();

				async move { source.read(&missing).await }
			})
			.await
	}

	/// Consume the upstream change feed until `shutdown` flips.
	///
	/// Transport failures reconnect with backoff; after any interruption the
	/// resident set is conservatively discarded and re-published, since the
	/// changes missed during the outage are unknown.
	pub(crate) async fn ingest(self, policy: RetryPolicy, mut shutdown: watch::Receiver<bool>) {
		let mut executor = RetryExecutor::new(policy);
		let mut resumed = false;

		loop {
			if *shutdown.borrow() {
				return;
			}

			match self.source.changes().await {
				Ok(mut stream) => {
					if resumed {
						let discarded = self.cache.discard_known().await;

						tracing::warn!(
							keys = discarded.len(),
							"change feed resumed; conservatively invalidating the resident set"
						);

						self.topic.publish(discarded).await;
					}

					resumed = true;
					executor.reset();

					loop {
						tokio::select! {
							_ = shutdown.changed() => return,
							next = stream.next() => match next {
								Some(Ok(batch)) => self.apply(batch).await,
								Some(Err(err)) => {
									tracing::warn!(error = %err, "change feed failed; reconnecting");

									break;
								},
								None => {
									tracing::warn!("change feed ended; reconnecting");

									break;
								},
							},
						}
					}
				},
				Err(err) => {
					resumed = true;

					tracing::warn!(error = %err, "connecting to the change feed failed");
				},
			}

			let delay = executor.next_backoff();

			tokio::select! {
				_ = shutdown.changed() => return,
				_ = tokio::time::sleep(delay) => {},
			}
		}
	}

	/// Apply one change batch: invalidate first, then publish, in that order.
	pub(crate) async fn apply(&self, batch: ChangeBatch) {
		let keys: Vec<Key> = batch.keys().cloned().collect();

		self.cache.set_if_exist(batch).await;
		self.topic.publish(keys).await;
	}
}
impl fmt::Debug for Datastore {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Datastore").field("cache", &self.cache).field("topic", &self.topic).finish()
	}
}
