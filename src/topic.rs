//! Broadcast log of invalidated keys with blocking wait-for-change.

// std
use std::collections::{HashSet, VecDeque};
// crates.io
use tokio::sync::{Mutex, Notify};
// self
use crate::{_prelude::*, key::Key};

/// Default number of retained events before old positions are lost.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Opaque, totally ordered position in a topic's event sequence.
///
/// The default (zero) cursor means "wait for the next event"; it never replays
/// history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor(u64);

/// Append-only sequence of invalidation events with wake-all delivery.
///
/// Retention is a ring sized by the expected churn: a subscriber that falls
/// further behind than the ring holds receives [`Error::LostPosition`] and has
/// to treat its whole key set as changed.
#[derive(Clone, Debug)]
pub struct Topic {
	inner: Arc<TopicInner>,
}
impl Topic {
	/// Create a topic with the default retention capacity.
	pub fn new() -> Self {
		Self::with_capacity(DEFAULT_CAPACITY)
	}

	/// Create a topic retaining at most `capacity` events.
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			inner: Arc::new(TopicInner {
				state: Mutex::new(TopicState {
					events: VecDeque::new(),
					next_id: 1,
					last_published_at: None,
				}),
				notify: Notify::new(),
				capacity: capacity.max(1),
			}),
		}
	}

	/// Append one event and wake every waiter; returns the event's cursor.
	///
	/// Publishing an empty key set is a no-op and returns the newest cursor.
	pub async fn publish(&self, keys: Vec<Key>) -> Cursor {
		let cursor = {
			let mut state = self.inner.state.lock().await;

			if keys.is_empty() {
				return Cursor(state.next_id - 1);
			}

			let id = state.next_id;

			state.next_id += 1;
			state.last_published_at = Some(Utc::now());
			state.events.push_back(Event { id, keys });

			while state.events.len() > self.inner.capacity {
				state.events.pop_front();
			}

			Cursor(id)
		};

		#[cfg(feature = "metrics")]
		crate::metrics::record_publish();

		self.inner.notify.notify_waiters();

		cursor
	}

	/// Newest cursor without blocking; the zero cursor when nothing was
	/// published yet.
	pub async fn current(&self) -> Cursor {
		Cursor(self.inner.state.lock().await.next_id - 1)
	}

	/// Return every key published after `since`, blocking until there is at
	/// least one.
	///
	/// Events are batched: the result is the union of all pending key sets
	/// together with the newest cursor. A cursor older than the retained ring
	/// yields [`Error::LostPosition`].
	pub async fn receive(&self, since: Cursor) -> Result<(Vec<Key>, Cursor)> {
		// The zero cursor binds to the newest position once, on entry; only
		// events published after this point are delivered.
		let since = if since == Cursor::default() { self.current().await } else { since };

		loop {
			let notified = self.inner.notify.notified();

			tokio::pin!(notified);
			// Register interest before checking state, so a publish racing
			// with the check below still wakes this waiter.
			notified.as_mut().enable();

			{
				let state = self.inner.state.lock().await;
				let newest = state.next_id - 1;

				if let Some(front) = state.events.front()
					&& since.0 + 1 < front.id
				{
					return Err(Error::LostPosition);
				}

				if since.0 < newest {
					let mut seen = HashSet::new();
					let keys = state
						.events
						.iter()
						.filter(|event| event.id > since.0)
						.flat_map(|event| event.keys.iter())
						.filter(|key| seen.insert((*key).clone()))
						.cloned()
						.collect();

					return Ok((keys, Cursor(newest)));
				}
			}

			notified.as_mut().await;
		}
	}

	/// Point-in-time view for status reporting.
	pub async fn snapshot(&self) -> TopicSnapshot {
		let state = self.inner.state.lock().await;

		TopicSnapshot {
			cursor: Cursor(state.next_id - 1),
			retained_events: state.events.len(),
			last_published_at: state.last_published_at,
		}
	}
}
impl Default for Topic {
	fn default() -> Self {
		Self::new()
	}
}

/// Status view over a topic.
#[derive(Clone, Copy, Debug)]
pub struct TopicSnapshot {
	/// Newest cursor, equal to the number of events ever published.
	pub cursor: Cursor,
	/// Events currently held in the retention ring.
	pub retained_events: usize,
	/// Wall-clock time of the most recent publication.
	pub last_published_at: Option<DateTime<Utc>>,
}
impl TopicSnapshot {
	/// Total number of events ever published on the topic.
	pub fn published_events(&self) -> u64 {
		self.cursor.0
	}
}

#[derive(Debug)]
struct TopicInner {
	state: Mutex<TopicState>,
	notify: Notify,
	capacity: usize,
}

#[derive(Debug)]
struct TopicState {
	events: VecDeque<Event>,
	next_id: u64,
	last_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Event {
	id: u64,
	keys: Vec<Key>,
}
