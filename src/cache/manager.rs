//! Key cache manager: single-flight fetch coalescing and external invalidation.

// std
use std::{
	collections::{HashMap, HashSet},
	future::Future,
};
// crates.io
use tokio::sync::{Mutex, watch};
// self
use crate::{
	_prelude::*,
	cache::state::{EntryState, FetchSignal, PendingFetch, Value},
	key::Key,
	metrics::CacheMetrics,
};

/// Map from datastore key to raw JSON value with single-flight fetches.
///
/// Values are served from memory once resident; concurrent misses for the same
/// key trigger one underlying fetch; invalidations arriving while a fetch is
/// in flight always win over the fetch result. Entries are created on first
/// demand only, so the resident set stays bounded by subscriber interest.
///
/// Instances are cheap to clone and share the same entry map.
#[derive(Clone, Debug, Default)]
pub struct KeyCache {
	entries: Arc<Mutex<HashMap<Key, EntryState>>>,
	metrics: Arc<CacheMetrics>,
}
impl KeyCache {
	/// Create an empty cache.
	pub fn new() -> Self {
		Self::default()
	}

	/// Access the cache's counter accumulator.
	pub fn metrics(&self) -> Arc<CacheMetrics> {
		self.metrics.clone()
	}

	/// Resolve `keys` to values, fetching the missing subset through `fetcher`.
	///
	/// The returned vector matches `keys` in order and length; `None` marks a
	/// key absent upstream. Each missing key is fetched at most once across
	/// all concurrent callers; the fetch runs in a detached task, so dropping
	/// a caller neither aborts it nor disturbs other waiters. A fetch failure
	/// is returned to the caller that triggered the fetch; waiting callers
	/// re-enter the miss path and retry with their own fetch.
	pub async fn get_or_set<F, Fut>(&self, keys: &[Key], fetcher: F) -> Result<Vec<Value>>
	where
		F: Fn(Vec<Key>) -> Fut,
		Fut: Future<Output = Result<HashMap<Key, Bytes>>> + Send + 'static,
	{
		let mut resolved: HashMap<Key, Value> = HashMap::with_capacity(keys.len());
		let mut remaining = {
			let mut seen = HashSet::with_capacity(keys.len());
			let mut unique = Vec::with_capacity(keys.len());

			for key in keys {
				if seen.insert(key.clone()) {
					unique.push(key.clone());
				}
			}

			unique
		};
		let mut first_round = true;

		loop {
			let mut waiting = Vec::new();
			let mut fetch_round: Option<(Vec<Key>, Arc<watch::Sender<FetchSignal>>)> = None;

			{
				let mut entries = self.entries.lock().await;

				for key in remaining.drain(..) {
					match entries.get(&key) {
						Some(EntryState::Ready(value)) => {
							resolved.insert(key, value.clone());
						},
						Some(EntryState::Pending(pending)) =>
							waiting.push((key, pending.subscribe())),
						None => {
							let (batch, signal) = fetch_round.get_or_insert_with(|| {
								(Vec::new(), Arc::new(watch::channel(FetchSignal::InFlight).0))
							});

							entries
								.insert(key.clone(), EntryState::Pending(PendingFetch::new(signal.clone())));
							batch.push(key);
						},
					}
				}
			}

			if first_round {
				let missed =
					fetch_round.as_ref().map(|(batch, _)| batch.len()).unwrap_or_default();

				self.metrics.record_lookups(resolved.len() as u64, missed as u64);

				first_round = false;
			}

			if let Some((batch, signal)) = fetch_round {
				let mut done = signal.subscribe();
				let cache = self.clone();
				let fetch = fetcher(batch.clone());
				let fetched_batch = batch.clone();

				tokio::spawn(async move {
					let result = fetch.await;

					cache.commit(fetched_batch, result).await;
				});

				if done.changed().await.is_err() {
					return Err(Error::Fetch("fetch task terminated without committing".into()));
				}
				if let FetchSignal::Failed(message) = done.borrow().clone() {
					return Err(Error::Fetch(message));
				}

				let entries = self.entries.lock().await;

				for key in batch {
					match entries.get(&key) {
						Some(EntryState::Ready(value)) => {
							resolved.insert(key, value.clone());
						},
						// Invalidated and discarded mid-flight; retry with a fresh fetch.
						_ => remaining.push(key),
					}
				}
			}

			for (key, mut done) in waiting {
				// Completion or sender loss both mean the entry reached a final
				// state for that round; re-reading below decides what to do.
				let _ = done.changed().await;

				let entries = self.entries.lock().await;

				match entries.get(&key) {
					Some(EntryState::Ready(value)) => {
						resolved.insert(key, value.clone());
					},
					_ => remaining.push(key),
				}
			}

			if remaining.is_empty() {
				break;
			}
		}

		Ok(keys.iter().map(|key| resolved.get(key).cloned().flatten()).collect())
	}

	/// Apply upstream invalidations to already-resident keys.
	///
	/// Ready entries are overwritten (the absent marker is a legal new value);
	/// entries with a fetch in flight record the value as a pending override
	/// that wins at commit time; unknown keys are ignored so the resident set
	/// never grows beyond what readers asked for.
	pub async fn set_if_exist<I>(&self, updates: I)
	where
		I: IntoIterator<Item = (Key, Value)>,
	{
		let mut touched = 0;

		{
			let mut entries = self.entries.lock().await;

			for (key, value) in updates {
				match entries.get_mut(&key) {
					Some(EntryState::Ready(existing)) => {
						*existing = value;
						touched += 1;
					},
					Some(EntryState::Pending(pending)) => {
						pending.record_replace(value);
						touched += 1;
					},
					None => {},
				}
			}
		}

		self.metrics.record_invalidations(touched);
	}

	/// Drop every committed entry and poison every in-flight fetch.
	///
	/// Used after an upstream reconnect, when the set of missed changes is
	/// unknown: subsequent reads re-fetch, and fetches already in flight
	/// discard their results. Returns the affected keys for publication.
	pub async fn discard_known(&self) -> Vec<Key> {
		let keys: Vec<Key> = {
			let mut entries = self.entries.lock().await;
			let keys = entries.keys().cloned().collect();

			entries.retain(|_, state| match state {
				EntryState::Ready(_) => false,
				EntryState::Pending(pending) => {
					pending.record_discard();

					true
				},
			});

			keys
		};

		self.metrics.record_invalidations(keys.len() as u64);

		keys
	}

	/// Number of resident keys, committed or in flight.
	pub async fn len(&self) -> usize {
		self.entries.lock().await.len()
	}

	/// Whether the cache holds no entries.
	pub async fn is_empty(&self) -> bool {
		self.entries.lock().await.is_empty()
	}

	async fn commit(&self, batch: Vec<Key>, result: Result<HashMap<Key, Bytes>>) {
		match &result {
			Ok(_) => self.metrics.record_fetch_success(),
			Err(_) => self.metrics.record_fetch_error(),
		}

		let signal = {
			let mut entries = self.entries.lock().await;
			let mut signal = None;

			match result {
				Ok(mut fetched) => {
					for key in batch {
						match entries.remove(&key) {
							Some(EntryState::Pending(pending)) => {
								let (committed, sender) = pending.resolve(fetched.remove(&key));

								if let Some(value) = committed {
									entries.insert(key, EntryState::Ready(value));
								}

								signal = Some((sender, FetchSignal::Done));
							},
							Some(other) => {
								entries.insert(key, other);
							},
							None => {},
						}
					}
				},
				Err(err) => {
					let message = err.to_string();

					tracing::debug!(error = %message, "fetch failed; dropping pending entries");

					for key in batch {
						match entries.remove(&key) {
							Some(EntryState::Pending(pending)) =>
								signal = Some((
									pending.into_signal(),
									FetchSignal::Failed(message.clone()),
								)),
							Some(other) => {
								entries.insert(key, other);
							},
							None => {},
						}
					}
				},
			}

			signal
		};

		if let Some((sender, outcome)) = signal {
			sender.send_replace(outcome);
		}
	}
}
