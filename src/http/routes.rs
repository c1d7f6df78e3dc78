//! HTTP surface for subscriptions and service introspection.

// std
use std::convert::Infallible;
// crates.io
use axum::{
	Json, Router,
	body::Body,
	extract::{RawQuery, State},
	http::{HeaderMap, StatusCode, header},
	response::{IntoResponse, Response},
	routing::get,
};
use futures_util::{StreamExt, stream};
use tokio::net::TcpListener;
// self
use crate::{
	_prelude::*,
	request::Selector,
	service::{Autoupdate, ServiceStatus},
	subscription::Subscription,
};

/// Build the service router.
///
/// `GET /system/autoupdate` takes a JSON list of structured key requests in
/// the body; `GET /system/autoupdate/keys` takes plain keys in the query
/// string. Both respond with a newline-delimited stream of JSON payload
/// objects that stays open until the client disconnects.
pub fn router(service: Arc<Autoupdate>) -> Router {
	Router::new()
		.route("/system/autoupdate", get(autoupdate))
		.route("/system/autoupdate/keys", get(autoupdate_keys))
		.route("/system/autoupdate/health", get(health))
		.route("/system/autoupdate/status", get(service_status))
		.with_state(service)
}

/// Serve the router on the given listener until the connection task fails.
pub async fn serve(service: Arc<Autoupdate>, listener: TcpListener) -> Result<()> {
	tracing::info!(addr = ?listener.local_addr().ok(), "autoupdate surface listening");

	axum::serve(listener, router(service)).await.map_err(Error::from)
}

async fn autoupdate(
	State(service): State<Arc<Autoupdate>>,
	headers: HeaderMap,
	body: Bytes,
) -> Result<Response> {
	let selector = Selector::parse_body(&body)?;

	stream_payloads(service.subscribe(user_id(&headers), selector)).await
}

async fn autoupdate_keys(
	State(service): State<Arc<Autoupdate>>,
	headers: HeaderMap,
	RawQuery(query): RawQuery,
) -> Result<Response> {
	let selector = Selector::parse_keys(query.as_deref().unwrap_or_default())?;

	stream_payloads(service.subscribe(user_id(&headers), selector)).await
}

async fn health() -> Json<serde_json::Value> {
	Json(serde_json::json!({ "healthy": true }))
}

async fn service_status(State(service): State<Arc<Autoupdate>>) -> Json<ServiceStatus> {
	Json(service.status().await)
}

async fn stream_payloads(mut subscription: Subscription) -> Result<Response> {
	// The first payload is produced before committing to a response, so
	// expansion and fetch failures still surface as proper error statuses.
	let first = subscription.next_payload().await?;
	let rest = stream::unfold(subscription, |mut subscription| async move {
		match subscription.next_payload().await {
			Ok(Some(payload)) => Some((Ok::<_, Infallible>(payload), subscription)),
			Ok(None) => None,
			// The error object becomes the final line of the stream; the
			// subscription is already closed, so the next round ends it.
			Err(err) => Some((Ok(error_line(&err)), subscription)),
		}
	});
	let stream = stream::iter(first.map(Ok::<_, Infallible>)).chain(rest);

	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/octet-stream")
		.body(Body::from_stream(stream))
		.map_err(Error::from)
}

fn user_id(headers: &HeaderMap) -> u64 {
	headers
		.get("x-user-id")
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.trim().parse().ok())
		.unwrap_or_default()
}

fn error_body(err: &Error) -> serde_json::Value {
	serde_json::json!({ "error": { "type": err.kind(), "msg": err.to_string() } })
}

fn error_line(err: &Error) -> Bytes {
	let mut line = error_body(err).to_string().into_bytes();

	line.push(b'\n');

	Bytes::from(line)
}

impl IntoResponse for Error {
	fn into_response(self) -> Response {
		let status = match &self {
			Error::Syntax(_)
			| Error::Json(_)
			| Error::Value(_)
			| Error::InvalidKeys { .. }
			| Error::Url(_) => StatusCode::BAD_REQUEST,
			Error::Fetch(_) | Error::Reqwest(_) => StatusCode::BAD_GATEWAY,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};

		if let Error::InvalidKeys { keys } = &self {
			tracing::warn!(?keys, "request rejected for invalid keys");
		} else if status.is_server_error() {
			tracing::error!(error = %self, "request failed");
		} else {
			tracing::warn!(error = %self, "request rejected");
		}

		(status, Json(error_body(&self))).into_response()
	}
}
