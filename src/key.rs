//! Datastore key type and boundary validation.

// std
use std::{borrow::Borrow, fmt};
// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// A datastore key of the form `collection/id/field`.
///
/// The cache, topic, and facade treat keys as opaque identifiers; only the
/// request boundary enforces the shape. Keys are cheap to clone — the backing
/// string is shared.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(Arc<str>);
impl Key {
	/// Parse and validate a raw key string.
	///
	/// A valid key is `collection/id/field` where collection and field are
	/// lowercase snake-case identifiers starting with a letter and id is a
	/// positive decimal integer.
	pub fn parse(raw: &str) -> Result<Self> {
		let invalid = || Error::InvalidKeys { keys: vec![raw.to_string()] };
		let mut parts = raw.split('/');
		let (collection, id, field) =
			match (parts.next(), parts.next(), parts.next(), parts.next()) {
				(Some(collection), Some(id), Some(field), None) => (collection, id, field),
				_ => return Err(invalid()),
			};

		if !is_identifier(collection) || !is_identifier(field) {
			return Err(invalid());
		}
		if id.parse::<u64>().map(|id| id == 0).unwrap_or(true) {
			return Err(invalid());
		}

		Ok(Self(Arc::from(raw)))
	}

	/// Build a key from trusted, already-validated parts.
	pub fn from_parts(collection: &str, id: u64, field: &str) -> Self {
		Self(Arc::from(format!("{collection}/{id}/{field}")))
	}

	/// Collection segment of the key.
	pub fn collection(&self) -> &str {
		self.0.split('/').next().unwrap_or_default()
	}

	/// Object id segment of the key.
	pub fn id(&self) -> u64 {
		self.0.split('/').nth(1).and_then(|id| id.parse().ok()).unwrap_or_default()
	}

	/// Field segment of the key.
	pub fn field(&self) -> &str {
		self.0.split('/').nth(2).unwrap_or_default()
	}

	/// The full key string.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl fmt::Display for Key {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
impl fmt::Debug for Key {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Key({})", self.0)
	}
}
impl Borrow<str> for Key {
	fn borrow(&self) -> &str {
		&self.0
	}
}
impl TryFrom<String> for Key {
	type Error = Error;

	fn try_from(value: String) -> Result<Self> {
		Self::parse(&value)
	}
}
impl From<Key> for String {
	fn from(value: Key) -> Self {
		value.0.to_string()
	}
}

pub(crate) fn is_identifier(segment: &str) -> bool {
	let mut bytes = segment.bytes();

	bytes.next().map(|b| b.is_ascii_lowercase()).unwrap_or(false)
		&& bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}
