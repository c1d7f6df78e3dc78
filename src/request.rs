//! Structured key requests: parsing, validation, and relation expansion.

// std
use std::collections::{BTreeSet, HashMap};
// crates.io
use serde::{Deserialize, Deserializer};
// self
use crate::{
	_prelude::*,
	datastore::Datastore,
	key::{self, Key},
};

/// What a connection subscribes to.
#[derive(Clone, Debug)]
pub enum Selector {
	/// A fixed, flat key set (the simple query form).
	Keys(Vec<Key>),
	/// Structured key requests expanded through relation fields.
	Requests(Vec<KeyRequest>),
}
impl Selector {
	/// Parse the simple query form: full datastore keys separated by `,` (or
	/// `&`, when clients send each key as its own parameter).
	pub fn parse_keys(raw_query: &str) -> Result<Self> {
		let mut keys = Vec::new();
		let mut invalid = Vec::new();

		for raw in raw_query.split(['&', ',']).map(str::trim).filter(|raw| !raw.is_empty()) {
			match Key::parse(raw) {
				Ok(key) => keys.push(key),
				Err(_) => invalid.push(raw.to_string()),
			}
		}

		if !invalid.is_empty() {
			return Err(Error::InvalidKeys { keys: invalid });
		}
		if keys.is_empty() {
			return Err(Error::Syntax("No data".into()));
		}

		Ok(Self::Keys(keys))
	}

	/// Parse the structured body form: a JSON list of key requests.
	pub fn parse_body(body: &[u8]) -> Result<Self> {
		if body.iter().all(u8::is_ascii_whitespace) {
			return Err(Error::Syntax("No data".into()));
		}

		let root: serde_json::Value = serde_json::from_slice(body)?;
		let serde_json::Value::Array(items) = root else {
			let offset =
				body.iter().position(|b| !b.is_ascii_whitespace()).map(|i| i + 1).unwrap_or(1);

			return Err(Error::Syntax(format!("wrong format at byte {offset}")));
		};

		if items.is_empty() {
			return Err(Error::Syntax("No data".into()));
		}

		let mut requests = Vec::with_capacity(items.len());

		for item in items {
			if item.get("collection").and_then(serde_json::Value::as_str).is_none() {
				return Err(Error::Syntax("no collection".into()));
			}

			let request: KeyRequest =
				serde_json::from_value(item).map_err(|err| Error::Syntax(err.to_string()))?;

			request.validate()?;
			requests.push(request);
		}

		Ok(Self::Requests(requests))
	}

	/// Expand to the flat key set, resolving relation fields through the
	/// facade.
	pub async fn expand(&self, datastore: &Datastore) -> Result<Vec<Key>> {
		match self {
			Self::Keys(keys) => Ok(keys.clone()),
			Self::Requests(requests) => expand_requests(requests, datastore).await,
		}
	}
}

/// One structured request: a set of objects in a collection and the fields to
/// deliver, where relation fields pull further objects in recursively.
#[derive(Clone, Debug, Deserialize)]
pub struct KeyRequest {
	/// Collection the requested objects belong to.
	pub collection: String,
	/// Object ids within the collection.
	#[serde(default)]
	pub ids: Vec<u64>,
	/// Requested fields by name.
	#[serde(default)]
	pub fields: HashMap<String, FieldRequest>,
}
impl KeyRequest {
	/// Validate identifiers so every key built during expansion is well
	/// formed.
	pub fn validate(&self) -> Result<()> {
		if !key::is_identifier(&self.collection) {
			return Err(Error::Value(format!("invalid collection `{}`", self.collection)));
		}
		if self.ids.iter().any(|id| *id == 0) {
			return Err(Error::Value(format!(
				"invalid id 0 in collection `{}`",
				self.collection
			)));
		}

		for (field, request) in &self.fields {
			if !key::is_identifier(field) {
				return Err(Error::Value(format!("invalid field `{field}`")));
			}
			if let FieldRequest::Relation { collection, fields } = request {
				let nested = KeyRequest {
					collection: collection.clone(),
					ids: Vec::new(),
					fields: fields.clone(),
				};

				nested.validate()?;
			}
		}

		Ok(())
	}
}

/// A requested field: either a plain value or a relation to follow.
#[derive(Clone, Debug)]
pub enum FieldRequest {
	/// Deliver the field value as is.
	Scalar,
	/// Treat the field value as ids into another collection and request
	/// `fields` for each referenced object.
	Relation {
		/// Collection the relation points into.
		collection: String,
		/// Fields requested for each referenced object.
		fields: HashMap<String, FieldRequest>,
	},
}
impl<'de> Deserialize<'de> for FieldRequest {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		#[derive(Deserialize)]
		struct RawField {
			#[serde(rename = "type")]
			kind: String,
			collection: String,
			#[serde(default)]
			fields: HashMap<String, FieldRequest>,
		}

		match Option::<RawField>::deserialize(deserializer)? {
			None => Ok(Self::Scalar),
			Some(raw) if raw.kind == "relation" =>
				Ok(Self::Relation { collection: raw.collection, fields: raw.fields }),
			Some(raw) =>
				Err(serde::de::Error::custom(format!("unknown field type `{}`", raw.kind))),
		}
	}
}

async fn expand_requests(requests: &[KeyRequest], datastore: &Datastore) -> Result<Vec<Key>> {
	let mut seen = BTreeSet::new();
	let mut frontier: Vec<(&str, Vec<u64>, &HashMap<String, FieldRequest>)> =
		requests.iter().map(|r| (r.collection.as_str(), r.ids.clone(), &r.fields)).collect();

	// Each pass materializes the frontier's keys, then resolves the fresh
	// relation keys to build the next frontier. Cycles converge because only
	// keys newly added to the flat set are followed.
	while !frontier.is_empty() {
		let mut relations: Vec<(Key, &FieldRequest)> = Vec::new();

		for (collection, ids, fields) in frontier.drain(..) {
			for id in ids {
				for (field, request) in fields {
					let key = Key::from_parts(collection, id, field);
					let fresh = seen.insert(key.clone());

					if fresh && matches!(request, FieldRequest::Relation { .. }) {
						relations.push((key, request));
					}
				}
			}
		}

		if relations.is_empty() {
			break;
		}

		let keys: Vec<Key> = relations.iter().map(|(key, _)| key.clone()).collect();
		let values = datastore.get(&keys).await?;

		for ((key, request), value) in relations.into_iter().zip(values) {
			let FieldRequest::Relation { collection, fields } = request else {
				continue;
			};
			let Some(bytes) = value else {
				continue;
			};
			let ids = relation_ids(&key, &bytes)?;

			if !ids.is_empty() {
				frontier.push((collection.as_str(), ids, fields));
			}
		}
	}

	Ok(seen.into_iter().collect())
}

fn relation_ids(key: &Key, bytes: &[u8]) -> Result<Vec<u64>> {
	let invalid = || Error::Value(format!("invalid value in key {key}"));
	let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|_| invalid())?;

	match value {
		serde_json::Value::Null => Ok(Vec::new()),
		serde_json::Value::Number(id) =>
			id.as_u64().filter(|id| *id > 0).map(|id| vec![id]).ok_or_else(invalid),
		serde_json::Value::Array(items) => items
			.into_iter()
			.map(|item| item.as_u64().filter(|id| *id > 0).ok_or_else(invalid))
			.collect(),
		_ => Err(invalid()),
	}
}
