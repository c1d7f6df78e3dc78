//! Upstream datastore access over HTTP.

// std
use std::collections::HashMap;
// crates.io
use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{Stream, StreamExt, stream};
use reqwest::{Client, redirect::Policy};
use serde::Serialize;
use serde_json::value::RawValue;
use url::Url;
// self
use crate::{
	_prelude::*,
	datastore::{ChangeBatch, ChangeStream, Source},
	key::Key,
};

/// Default response size guard for upstream reads (32 MiB).
pub const DEFAULT_MAX_RESPONSE_BYTES: u64 = 32 * 1024 * 1024;

/// [`Source`] implementation speaking JSON over HTTP.
///
/// Reads POST the missing key list to `<base>/get_many` and expect a JSON
/// object from key to value; the change feed streams newline-delimited JSON
/// objects from `<base>/changes`, each line one batch, with `null` marking a
/// deleted key. The base URL should end with a trailing slash.
#[derive(Clone, Debug)]
pub struct HttpSource {
	client: Client,
	reader_url: Url,
	changes_url: Url,
	attempt_timeout: Duration,
	max_response_bytes: u64,
}
impl HttpSource {
	/// Build a source with a default HTTP client.
	pub fn new(base: Url) -> Result<Self> {
		let client = Client::builder()
			.redirect(Policy::limited(10))
			.user_agent(format!("autofeed/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(5))
			.build()?;

		Self::with_client(base, client)
	}

	/// Build a source using the supplied HTTP client (primarily for tests).
	pub fn with_client(base: Url, client: Client) -> Result<Self> {
		Ok(Self {
			reader_url: base.join("get_many")?,
			changes_url: base.join("changes")?,
			client,
			attempt_timeout: Duration::from_secs(10),
			max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
		})
	}

	/// Timeout applied to each read request.
	pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
		self.attempt_timeout = timeout;

		self
	}

	/// Size guard applied to read responses.
	pub fn max_response_bytes(mut self, limit: u64) -> Self {
		self.max_response_bytes = limit;

		self
	}
}
#[async_trait]
impl Source for HttpSource {
	async fn read(&self, keys: &[Key]) -> Result<HashMap<Key, Bytes>> {
		#[derive(Serialize)]
		struct ReadRequest<'a> {
			keys: &'a [Key],
		}

		let response = self
			.client
			.post(self.reader_url.clone())
			.timeout(self.attempt_timeout)
			.json(&ReadRequest { keys })
			.send()
			.await?;
		let status = response.status();

		if !status.is_success() {
			return Err(Error::Fetch(format!(
				"upstream status {status} from {}",
				self.reader_url
			)));
		}

		let bytes = response.bytes().await?;

		if bytes.len() as u64 > self.max_response_bytes {
			return Err(Error::Validation {
				field: "max_response_bytes",
				reason: format!(
					"Response size {size} bytes exceeds the configured guard of {limit} bytes.",
					size = bytes.len(),
					limit = self.max_response_bytes
				),
			});
		}

		let values: HashMap<Key, Option<Box<RawValue>>> = serde_json::from_slice(&bytes)?;

		tracing::debug!(requested = keys.len(), returned = values.len(), "upstream read complete");

		Ok(values
			.into_iter()
			.filter_map(|(key, value)| value.map(|raw| (key, Bytes::from(raw.get().to_string()))))
			.collect())
	}

	async fn changes(&self) -> Result<ChangeStream> {
		let response = self.client.get(self.changes_url.clone()).send().await?;
		let status = response.status();

		if !status.is_success() {
			return Err(Error::Fetch(format!(
				"upstream status {status} from {}",
				self.changes_url
			)));
		}

		tracing::debug!(url = %self.changes_url, "change feed connected");

		Ok(ndjson_batches(response.bytes_stream()))
	}
}

/// Split a chunked byte stream into newline-delimited JSON change batches.
///
/// Blank lines are keepalives and skipped; a trailing unterminated line is
/// parsed once the stream ends; a transport error terminates the stream after
/// surfacing it.
fn ndjson_batches<S>(chunks: S) -> ChangeStream
where
	S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
	let state = (Box::pin(chunks), BytesMut::new(), false);

	Box::pin(stream::unfold(state, |(mut chunks, mut buffer, mut ended)| async move {
		loop {
			if let Some(line) = next_line(&mut buffer, ended) {
				if line.iter().all(u8::is_ascii_whitespace) {
					continue;
				}

				return Some((parse_batch(&line), (chunks, buffer, ended)));
			}
			if ended {
				return None;
			}

			match chunks.next().await {
				Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
				Some(Err(err)) => {
					ended = true;

					return Some((Err(err.into()), (chunks, buffer, ended)));
				},
				None => ended = true,
			}
		}
	}))
}

fn next_line(buffer: &mut BytesMut, ended: bool) -> Option<BytesMut> {
	if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
		let mut line = buffer.split_to(pos + 1);

		line.truncate(pos);

		if line.last() == Some(&b'\r') {
			line.truncate(line.len() - 1);
		}

		return Some(line);
	}
	if ended && !buffer.is_empty() {
		return Some(buffer.split());
	}

	None
}

fn parse_batch(line: &[u8]) -> Result<ChangeBatch> {
	let updates: HashMap<Key, Option<Box<RawValue>>> = serde_json::from_slice(line)?;

	Ok(updates
		.into_iter()
		.map(|(key, value)| (key, value.map(|raw| Bytes::from(raw.get().to_string()))))
		.collect())
}
