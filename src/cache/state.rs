//! Cache entry states and in-flight fetch bookkeeping.

// crates.io
use tokio::sync::watch;
// self
use crate::_prelude::*;

/// A cached datastore value: raw JSON bytes, or `None` for a key that does not
/// exist upstream (distinct from "not yet requested").
pub type Value = Option<Bytes>;

/// Completion signal broadcast to every caller waiting on an in-flight fetch.
#[derive(Clone, Debug)]
pub(crate) enum FetchSignal {
	/// The fetch is still running.
	InFlight,
	/// The fetch committed; the entry map holds the outcome.
	Done,
	/// The fetch failed with the contained message; the entries were removed.
	Failed(String),
}

/// Invalidation state accumulated while a fetch is in flight.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum PendingOverride {
	/// No invalidation arrived; the fetch result may commit.
	#[default]
	None,
	/// An invalidation supplied a replacement; it wins over the fetch result.
	Replace(Value),
	/// The entry was invalidated with no replacement; the fetch result is
	/// discarded and the entry removed.
	Discard,
}

/// One cache slot: either a committed value or a fetch in flight.
#[derive(Debug)]
pub(crate) enum EntryState {
	/// A committed value, possibly the absent marker.
	Ready(Value),
	/// A fetch is in flight for this key.
	Pending(PendingFetch),
}

/// Bookkeeping for a key with a fetch in flight.
///
/// The signal channel is shared by every key installed by the same
/// `get_or_set` call; the epoch counts invalidations that arrived while the
/// fetch was running and the override records the most recent of them.
#[derive(Debug)]
pub(crate) struct PendingFetch {
	signal: Arc<watch::Sender<FetchSignal>>,
	epoch: u64,
	pending_override: PendingOverride,
}
impl PendingFetch {
	/// Install fresh bookkeeping bound to the given fetch-round signal.
	pub(crate) fn new(signal: Arc<watch::Sender<FetchSignal>>) -> Self {
		Self { signal, epoch: 0, pending_override: PendingOverride::None }
	}

	/// Subscribe a waiter to the completion of this fetch.
	pub(crate) fn subscribe(&self) -> watch::Receiver<FetchSignal> {
		self.signal.subscribe()
	}

	/// Record an invalidation that carries a replacement value.
	pub(crate) fn record_replace(&mut self, value: Value) {
		self.epoch += 1;
		self.pending_override = PendingOverride::Replace(value);
	}

	/// Record a valueless invalidation; the fetch result must be discarded.
	pub(crate) fn record_discard(&mut self) {
		self.epoch += 1;
		self.pending_override = PendingOverride::Discard;
	}

	/// Number of invalidations observed since the fetch started.
	pub(crate) fn epoch(&self) -> u64 {
		self.epoch
	}

	/// Decide what to commit for the fetched value.
	///
	/// Returns the value to install as `Ready`, or `None` when the entry must
	/// be removed, together with the signal sender for completion broadcast.
	pub(crate) fn resolve(
		self,
		fetched: Value,
	) -> (Option<Value>, Arc<watch::Sender<FetchSignal>>) {
		let committed = match self.pending_override {
			PendingOverride::None => Some(fetched),
			PendingOverride::Replace(value) => Some(value),
			PendingOverride::Discard => None,
		};

		(committed, self.signal)
	}

	/// Surrender the signal sender without committing anything.
	pub(crate) fn into_signal(self) -> Arc<watch::Sender<FetchSignal>> {
		self.signal
	}
}
