//! Cache behaviour under contention, invalidation, and failure.

// std
use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use autofeed::{Error, Key, KeyCache, Result, Value};
use bytes::Bytes;
use tokio::sync::Notify;
// self
use crate::support::k;

fn v(raw: &str) -> Value {
	Some(Bytes::from(raw.to_string()))
}

fn constant(
	value: &'static str,
	calls: Arc<AtomicUsize>,
) -> impl Fn(Vec<Key>) -> std::future::Ready<Result<HashMap<Key, Bytes>>> + Clone {
	move |keys: Vec<Key>| {
		calls.fetch_add(1, Ordering::SeqCst);

		std::future::ready(Ok(keys
			.into_iter()
			.map(|key| (key, Bytes::from_static(value.as_bytes())))
			.collect()))
	}
}

#[tokio::test]
async fn hit_returns_the_cached_value_without_fetching() {
	let cache = KeyCache::new();
	let first_calls = Arc::new(AtomicUsize::new(0));
	let second_calls = Arc::new(AtomicUsize::new(0));
	let first = cache
		.get_or_set(&[k("user/1/name")], constant("\"v\"", first_calls.clone()))
		.await
		.expect("get");
	let second = cache
		.get_or_set(&[k("user/1/name")], constant("\"x\"", second_calls.clone()))
		.await
		.expect("get");

	assert_eq!(first, vec![v("\"v\"")]);
	assert_eq!(second, vec![v("\"v\"")]);
	assert_eq!(first_calls.load(Ordering::SeqCst), 1);
	assert_eq!(second_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn keys_missing_from_the_fetch_result_are_absent() {
	let cache = KeyCache::new();
	let values = cache
		.get_or_set(&[k("user/1/name"), k("user/2/name")], |keys: Vec<Key>| {
			std::future::ready(Ok(keys
				.into_iter()
				.filter(|key| key.id() == 1)
				.map(|key| (key, Bytes::from_static(b"\"v\"")))
				.collect::<HashMap<_, _>>()))
		})
		.await
		.expect("get");

	assert_eq!(values, vec![v("\"v\""), None]);
}

#[tokio::test]
async fn concurrent_misses_share_a_single_fetch() {
	let cache = KeyCache::new();
	let gate = Arc::new(Notify::new());
	let leader_calls = Arc::new(AtomicUsize::new(0));
	let follower_calls = Arc::new(AtomicUsize::new(0));
	let leader = {
		let cache = cache.clone();
		let gate = gate.clone();
		let calls = leader_calls.clone();

		tokio::spawn(async move {
			cache
				.get_or_set(&[k("user/1/name")], move |keys: Vec<Key>| {
					calls.fetch_add(1, Ordering::SeqCst);

					let gate = gate.clone();

					async move {
						gate.notified().await;

						Ok(keys
							.into_iter()
							.map(|key| (key, Bytes::from_static(b"\"v\"")))
							.collect::<HashMap<_, _>>())
					}
				})
				.await
		})
	};

	// Let the leader install its pending entry before the second call starts.
	tokio::time::sleep(Duration::from_millis(10)).await;

	let follower = {
		let cache = cache.clone();

		tokio::spawn({
			let calls = follower_calls.clone();

			async move { cache.get_or_set(&[k("user/1/name")], constant("\"x\"", calls)).await }
		})
	};

	tokio::time::sleep(Duration::from_millis(10)).await;
	gate.notify_one();

	let leader_values = leader.await.expect("join").expect("get");
	let follower_values = tokio::time::timeout(Duration::from_millis(50), follower)
		.await
		.expect("follower must complete promptly after the fetch is released")
		.expect("join")
		.expect("get");

	assert_eq!(leader_values, vec![v("\"v\"")]);
	assert_eq!(follower_values, vec![v("\"v\"")]);
	assert_eq!(leader_calls.load(Ordering::SeqCst), 1);
	assert_eq!(follower_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalidation_during_a_fetch_wins_over_the_fetch_result() {
	let cache = KeyCache::new();
	let gate = Arc::new(Notify::new());
	let slow = {
		let cache = cache.clone();
		let gate = gate.clone();

		tokio::spawn(async move {
			cache
				.get_or_set(&[k("user/1/name"), k("user/2/name")], move |keys: Vec<Key>| {
					let gate = gate.clone();

					async move {
						gate.notified().await;

						Ok(keys
							.into_iter()
							.map(|key| (key, Bytes::from_static(b"\"v1\"")))
							.collect::<HashMap<_, _>>())
					}
				})
				.await
		})
	};

	tokio::time::sleep(Duration::from_millis(10)).await;
	cache
		.set_if_exist([
			(k("user/1/name"), v("\"v2\"")),
			(k("user/2/name"), v("\"v2\"")),
		])
		.await;
	gate.notify_one();
	slow.await.expect("join").expect("get");

	let stale_calls = Arc::new(AtomicUsize::new(0));
	let values = cache
		.get_or_set(
			&[k("user/1/name"), k("user/2/name")],
			constant("\"stale\"", stale_calls.clone()),
		)
		.await
		.expect("get");

	// The overriding values were committed; the stale fetcher had nothing to
	// fill and must not have run.
	assert_eq!(values, vec![v("\"v2\""), v("\"v2\"")]);
	assert_eq!(stale_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn set_if_exist_only_touches_resident_keys() {
	let cache = KeyCache::new();
	let echo = |keys: Vec<Key>| {
		std::future::ready(Ok(keys
			.into_iter()
			.map(|key| {
				let value = Bytes::from(format!("\"{key}\""));

				(key, value)
			})
			.collect::<HashMap<_, _>>()))
	};
	let first = cache.get_or_set(&[k("user/1/name")], echo).await.expect("get");

	assert_eq!(first, vec![v("\"user/1/name\"")]);

	cache
		.set_if_exist([
			(k("user/1/name"), v("\"v'\"")),
			(k("user/2/name"), v("\"v'\"")),
		])
		.await;

	let values =
		cache.get_or_set(&[k("user/1/name"), k("user/2/name")], echo).await.expect("get");

	// user/2/name was not resident, so the fresh fetch fills it.
	assert_eq!(values, vec![v("\"v'\""), v("\"user/2/name\"")]);
}

#[tokio::test]
async fn a_failed_fetch_leaves_no_trace() {
	let cache = KeyCache::new();
	let err = cache
		.get_or_set(&[k("user/1/name")], |_: Vec<Key>| {
			std::future::ready(Err::<HashMap<Key, Bytes>, _>(Error::Fetch("boom".into())))
		})
		.await
		.expect_err("fetch error must surface");

	assert_eq!(err.kind(), "FetchError");
	assert!(err.to_string().contains("boom"), "unexpected error: {err}");

	let calls = Arc::new(AtomicUsize::new(0));
	let values = tokio::time::timeout(
		Duration::from_millis(50),
		cache.get_or_set(&[k("user/1/name")], constant("\"v\"", calls.clone())),
	)
	.await
	.expect("retry must not be blocked by the failed fetch")
	.expect("get");

	assert_eq!(values, vec![v("\"v\"")]);
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_leader_failure_does_not_poison_waiting_callers() {
	let cache = KeyCache::new();
	let gate = Arc::new(Notify::new());
	let leader = {
		let cache = cache.clone();
		let gate = gate.clone();

		tokio::spawn(async move {
			cache
				.get_or_set(&[k("user/1/name")], move |_: Vec<Key>| {
					let gate = gate.clone();

					async move {
						gate.notified().await;

						Err::<HashMap<Key, Bytes>, _>(Error::Fetch("boom".into()))
					}
				})
				.await
		})
	};

	tokio::time::sleep(Duration::from_millis(10)).await;

	let waiter_calls = Arc::new(AtomicUsize::new(0));
	let waiter = {
		let cache = cache.clone();
		let calls = waiter_calls.clone();

		tokio::spawn(async move { cache.get_or_set(&[k("user/1/name")], constant("\"v\"", calls)).await })
	};

	tokio::time::sleep(Duration::from_millis(10)).await;
	gate.notify_one();

	assert!(leader.await.expect("join").is_err(), "the triggering caller sees the error");

	// The waiter re-enters the miss path with its own fetcher and succeeds.
	let values = waiter.await.expect("join").expect("get");

	assert_eq!(values, vec![v("\"v\"")]);
	assert_eq!(waiter_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_canceled_caller_does_not_abort_the_shared_fetch() {
	let cache = KeyCache::new();
	let gate = Arc::new(Notify::new());
	let canceled = {
		let cache = cache.clone();
		let gate = gate.clone();

		tokio::spawn(async move {
			cache
				.get_or_set(&[k("user/1/name")], move |keys: Vec<Key>| {
					let gate = gate.clone();

					async move {
						gate.notified().await;

						Ok(keys
							.into_iter()
							.map(|key| (key, Bytes::from_static(b"\"v\"")))
							.collect::<HashMap<_, _>>())
					}
				})
				.await
		})
	};

	tokio::time::sleep(Duration::from_millis(10)).await;
	// Drop the triggering caller while its fetch is still in flight.
	canceled.abort();
	gate.notify_one();

	// The detached fetch still commits; a later caller gets the value without
	// fetching again.
	tokio::time::sleep(Duration::from_millis(20)).await;

	let calls = Arc::new(AtomicUsize::new(0));
	let values = cache
		.get_or_set(&[k("user/1/name")], constant("\"x\"", calls.clone()))
		.await
		.expect("get");

	assert_eq!(values, vec![v("\"v\"")]);
	assert_eq!(calls.load(Ordering::SeqCst), 0);
}
