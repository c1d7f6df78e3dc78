//! Per-connection subscription loop.

// std
use std::collections::{BTreeMap, HashMap};
// crates.io
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
// self
use crate::{
	_prelude::*,
	cache::state::Value,
	datastore::Datastore,
	key::Key,
	request::Selector,
	restrict::Restricter,
	service::ConnectionGuard,
	topic::Cursor,
};

/// Digest of an emitted value; `None` marks an emitted absent marker.
type ValueDigest = Option<[u8; 32]>;

/// One client's ongoing push of refreshed values.
///
/// Drive it by calling [`next_payload`](Self::next_payload) repeatedly: the
/// first call yields the complete snapshot for the expanded key set, every
/// later call blocks until a relevant upstream change and yields the keys
/// whose restricted value differs from the last emission. The selector is
/// re-expanded after every wakeup, since relation fields may point elsewhere
/// by then.
pub struct Subscription {
	datastore: Datastore,
	restricter: Arc<dyn Restricter>,
	uid: u64,
	selector: Selector,
	keys: Vec<Key>,
	cursor: Cursor,
	emitted: HashMap<Key, ValueDigest>,
	initial: bool,
	state: SubscriptionState,
	shutdown: watch::Receiver<bool>,
	_connection: ConnectionGuard,
}
impl Subscription {
	pub(crate) fn new(
		datastore: Datastore,
		restricter: Arc<dyn Restricter>,
		uid: u64,
		selector: Selector,
		shutdown: watch::Receiver<bool>,
		connection: ConnectionGuard,
	) -> Self {
		Self {
			datastore,
			restricter,
			uid,
			selector,
			keys: Vec::new(),
			cursor: Cursor::default(),
			emitted: HashMap::new(),
			initial: true,
			state: SubscriptionState::Expanding,
			shutdown,
			_connection: connection,
		}
	}

	/// Produce the next payload line, blocking until there is one.
	///
	/// Returns `Ok(None)` once the subscription is closed; any error also
	/// closes it, so a subsequent call returns `Ok(None)`.
	#[tracing::instrument(skip(self), fields(uid = self.uid))]
	pub async fn next_payload(&mut self) -> Result<Option<Bytes>> {
		let result = self.advance().await;

		if let Err(err) = &result {
			self.state = SubscriptionState::Closed;

			tracing::debug!(error = %err, "subscription closed");
		}

		result
	}

	/// Drive the state machine to the next payload.
	///
	/// Every await below is cancel-safe: dropping the future mid-step resumes
	/// the same step on the next call.
	async fn advance(&mut self) -> Result<Option<Bytes>> {
		loop {
			match &mut self.state {
				SubscriptionState::Closed => return Ok(None),
				SubscriptionState::Expanding => {
					let mut keys = self.selector.expand(&self.datastore).await?;

					keys.sort();
					keys.dedup();

					self.keys = keys;
					self.state = SubscriptionState::Fetching;
				},
				SubscriptionState::Fetching => {
					// Sampled before the fetch: a change racing with the read
					// below is then either visible in the fetched values or
					// delivered by the next receive, never lost.
					self.cursor = self.datastore.topic().current().await;

					let values = self.datastore.get(&self.keys).await?;
					let restricted =
						self.restricter.restrict(self.uid, &self.keys, values).await?;

					self.state = SubscriptionState::Emitting(restricted);
				},
				SubscriptionState::Emitting(values) => {
					let values = std::mem::take(values);

					self.state = SubscriptionState::Waiting;

					if let Some(payload) = self.render(&values)? {
						return Ok(Some(payload));
					}

					tracing::debug!("no-op wakeup suppressed");
				},
				SubscriptionState::Waiting => {
					self.wait_for_change().await?;
					self.state = SubscriptionState::Expanding;
				},
			}
		}
	}

	/// Block until an event intersects the expanded key set, the position is
	/// lost (treated as universal intersection), or the service shuts down.
	async fn wait_for_change(&mut self) -> Result<()> {
		loop {
			if *self.shutdown.borrow() {
				return Err(Error::Canceled);
			}

			let received = tokio::select! {
				_ = self.shutdown.changed() => return Err(Error::Canceled),
				received = self.datastore.topic().receive(self.cursor) => received,
			};

			match received {
				Ok((changed, cursor)) => {
					self.cursor = cursor;

					if changed.iter().any(|key| self.keys.binary_search(key).is_ok()) {
						return Ok(());
					}
				},
				Err(Error::LostPosition) => {
					tracing::debug!("topic position lost; treating the whole key set as changed");

					return Ok(());
				},
				Err(err) => return Err(err),
			}
		}
	}

	/// Diff the restricted values against the last emission and render the
	/// changed subset as one JSON object line.
	fn render(&mut self, values: &[Value]) -> Result<Option<Bytes>> {
		let mut digests = HashMap::with_capacity(self.keys.len());
		let mut changed = Vec::new();

		for (index, (key, value)) in self.keys.iter().zip(values).enumerate() {
			let digest: ValueDigest = value.as_ref().map(|bytes| Sha256::digest(bytes).into());

			if self.emitted.get(key) != Some(&digest) {
				changed.push(index);
			}

			digests.insert(key.clone(), digest);
		}

		// Keys that fell out of the expanded set are forgotten with the swap.
		self.emitted = digests;

		if changed.is_empty() && !self.initial {
			return Ok(None);
		}

		self.initial = false;

		let mut object: BTreeMap<&str, Option<&RawValue>> = BTreeMap::new();

		for index in changed {
			let key = &self.keys[index];
			let raw = match &values[index] {
				Some(bytes) => Some(raw_json(key, bytes)?),
				None => None,
			};

			object.insert(key.as_str(), raw);
		}

		let mut line = serde_json::to_vec(&object)?;

		line.push(b'\n');

		#[cfg(feature = "metrics")]
		crate::metrics::record_emission(object.len() as u64);

		Ok(Some(Bytes::from(line)))
	}
}

/// Subscription lifecycle; `Closed` is terminal.
#[derive(Debug)]
enum SubscriptionState {
	/// Resolving the selector to a flat key set.
	Expanding,
	/// Reading current values and applying the restricter.
	Fetching,
	/// Diffing and rendering the payload to push.
	Emitting(Vec<Value>),
	/// Blocked on the topic until a relevant change.
	Waiting,
	/// Disconnected, canceled, or failed.
	Closed,
}

fn raw_json<'a>(key: &Key, bytes: &'a Bytes) -> Result<&'a RawValue> {
	let text = std::str::from_utf8(bytes)
		.map_err(|_| Error::Value(format!("invalid value in key {key}")))?;

	serde_json::from_str::<&RawValue>(text)
		.map_err(|_| Error::Value(format!("invalid value in key {key}")))
}
