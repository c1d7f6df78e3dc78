//! Shared fixtures for the integration suite.

// std
use std::{
	collections::{HashMap, VecDeque},
	sync::{
		Mutex,
		atomic::{AtomicUsize, Ordering},
	},
};
// crates.io
use async_trait::async_trait;
use autofeed::{ChangeBatch, ChangeStream, Key, Result, Source};
use bytes::Bytes;
use tokio::sync::mpsc;

/// In-memory upstream: a mutable key/value map for reads plus scripted change
/// feed connections.
#[derive(Debug, Default)]
pub struct MemorySource {
	values: Mutex<HashMap<Key, Bytes>>,
	feeds: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<ChangeBatch>>>>,
	reads: AtomicUsize,
}
impl MemorySource {
	pub fn new() -> Self {
		let _ = tracing_subscriber::fmt::try_init();

		Self::default()
	}

	/// Seed or overwrite the upstream value for a key.
	pub fn set(&self, key: &str, value: &str) {
		self.values.lock().expect("values lock").insert(k(key), Bytes::from(value.to_string()));
	}

	/// Delete the upstream value for a key.
	pub fn remove(&self, key: &str) {
		self.values.lock().expect("values lock").remove(&k(key));
	}

	/// Number of `read` calls the source has served.
	pub fn reads(&self) -> usize {
		self.reads.load(Ordering::SeqCst)
	}

	/// Queue one change feed connection and return its sender.
	///
	/// The next `changes()` call consumes it; ingest reconnection consumes
	/// queued feeds in order.
	pub fn feed(&self) -> mpsc::UnboundedSender<Result<ChangeBatch>> {
		let (tx, rx) = mpsc::unbounded_channel();

		self.feeds.lock().expect("feeds lock").push_back(rx);

		tx
	}

	/// Apply a change to the upstream map and push it down the feed, the way
	/// a real datastore write would.
	pub fn change(
		&self,
		feed: &mpsc::UnboundedSender<Result<ChangeBatch>>,
		updates: &[(&str, Option<&str>)],
	) {
		let mut batch = ChangeBatch::new();

		{
			let mut values = self.values.lock().expect("values lock");

			for (key, value) in updates {
				let key = k(key);

				match value {
					Some(value) => {
						let bytes = Bytes::from(value.to_string());

						values.insert(key.clone(), bytes.clone());
						batch.insert(key, Some(bytes));
					},
					None => {
						values.remove(&key);
						batch.insert(key, None);
					},
				}
			}
		}

		feed.send(Ok(batch)).expect("feed closed");
	}
}
#[async_trait]
impl Source for MemorySource {
	async fn read(&self, keys: &[Key]) -> Result<HashMap<Key, Bytes>> {
		self.reads.fetch_add(1, Ordering::SeqCst);

		let values = self.values.lock().expect("values lock");

		Ok(keys.iter().filter_map(|key| values.get(key).map(|v| (key.clone(), v.clone()))).collect())
	}

	async fn changes(&self) -> Result<ChangeStream> {
		match self.feeds.lock().expect("feeds lock").pop_front() {
			Some(rx) => Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
				rx.recv().await.map(|item| (item, rx))
			}))),
			// No scripted feed: stay connected and silent.
			None => Ok(Box::pin(futures_util::stream::pending())),
		}
	}
}

/// Parse a test key, panicking on typos.
pub fn k(raw: &str) -> Key {
	Key::parse(raw).expect("test key")
}
