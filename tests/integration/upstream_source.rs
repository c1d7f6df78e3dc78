//! HTTP upstream source behaviour against a mock datastore.

// std
use std::time::Duration;
// crates.io
use autofeed::{Source, http::upstream::HttpSource};
use bytes::Bytes;
use futures_util::StreamExt;
use url::Url;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{body_partial_json, method, path},
};
// self
use crate::support::k;

async fn source_for(server: &MockServer) -> HttpSource {
	let _ = tracing_subscriber::fmt::try_init();
	let base = Url::parse(&format!("{}/", server.uri())).expect("base url");

	HttpSource::new(base).expect("source")
}

#[tokio::test]
async fn read_returns_values_and_omits_absent_keys() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/get_many"))
		.and(body_partial_json(serde_json::json!({ "keys": ["user/1/name", "user/2/name"] })))
		.respond_with(ResponseTemplate::new(200).set_body_string(r#"{"user/1/name": "ann"}"#))
		.expect(1)
		.mount(&server)
		.await;

	let source = source_for(&server).await;
	let values =
		source.read(&[k("user/1/name"), k("user/2/name")]).await.expect("read");

	assert_eq!(values.len(), 1);
	assert_eq!(values[&k("user/1/name")], Bytes::from_static(br#""ann""#));

	server.verify().await;
}

#[tokio::test]
async fn read_surfaces_upstream_failures_as_fetch_errors() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/get_many"))
		.respond_with(ResponseTemplate::new(500))
		.mount(&server)
		.await;

	let source = source_for(&server).await;
	let err = source.read(&[k("user/1/name")]).await.expect_err("read must fail");

	assert_eq!(err.kind(), "FetchError");
}

#[tokio::test]
async fn oversized_read_responses_are_rejected() {
	let server = MockServer::start().await;
	let huge = format!(r#"{{"user/1/name": "{}"}}"#, "x".repeat(64));

	Mock::given(method("POST"))
		.and(path("/get_many"))
		.respond_with(ResponseTemplate::new(200).set_body_string(huge))
		.mount(&server)
		.await;

	let source = source_for(&server).await.max_response_bytes(16);
	let err = source.read(&[k("user/1/name")]).await.expect_err("read must fail");

	assert_eq!(err.kind(), "ValueError");
}

#[tokio::test]
async fn changes_stream_newline_delimited_batches() {
	let server = MockServer::start().await;
	let body = "{\"user/1/name\": 1}\n\n{\"user/2/name\": null}\n";

	Mock::given(method("GET"))
		.and(path("/changes"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_string(body)
				.set_delay(Duration::from_millis(10)),
		)
		.mount(&server)
		.await;

	let source = source_for(&server).await;
	let mut stream = source.changes().await.expect("connect");
	let first = stream.next().await.expect("first batch").expect("batch");

	assert_eq!(first.len(), 1);
	assert_eq!(first[&k("user/1/name")].as_deref(), Some(&b"1"[..]));

	// The blank keepalive line is skipped; a null value marks a deletion.
	let second = stream.next().await.expect("second batch").expect("batch");

	assert_eq!(second.len(), 1);
	assert_eq!(second[&k("user/2/name")], None);
	assert!(stream.next().await.is_none(), "the finite body ends the stream");
}

#[tokio::test]
async fn connecting_to_a_failing_change_feed_errors() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/changes"))
		.respond_with(ResponseTemplate::new(503))
		.mount(&server)
		.await;

	let source = source_for(&server).await;
	let err = match source.changes().await {
		Ok(_) => panic!("connect must fail"),
		Err(err) => err,
	};

	assert_eq!(err.kind(), "FetchError");
}
