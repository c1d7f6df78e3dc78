//! Crate-wide error types and `Result` alias.

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the autofeed crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("{0}")]
	Syntax(String),
	#[error("{0}")]
	Value(String),
	#[error("Invalid keys")]
	InvalidKeys {
		/// Offending key strings; logged, never echoed to clients.
		keys: Vec<String>,
	},
	#[error("Fetch failed: {0}")]
	Fetch(String),
	#[error("Canceled")]
	Canceled,
	#[error("Position lost: the topic pruned events past the subscriber cursor.")]
	LostPosition,
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
impl Error {
	/// Wire-facing error kind, used as the `type` field of HTTP error bodies.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::Io(_) => "InternalError",
			Self::Http(_) => "InternalError",
			Self::Json(_) => "JsonError",
			Self::Reqwest(_) => "FetchError",
			Self::Url(_) => "ValueError",
			Self::Syntax(_) => "SyntaxError",
			Self::Value(_) => "ValueError",
			Self::InvalidKeys { .. } => "InvalidKeys",
			Self::Fetch(_) => "FetchError",
			Self::Canceled => "Canceled",
			Self::LostPosition => "LostPosition",
			Self::Metrics(_) => "InternalError",
			Self::Validation { .. } => "ValueError",
		}
	}
}
